//! Durable tracking-job queue. Jobs are keyed by batch cid with JSON
//! payloads; workers claim rows with a conditional update, retry with
//! backoff up to the cap, and drop poisoned jobs with an error trail in
//! the log.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use cid::Cid;
use piri_db::{Db, DbResult};
use rusqlite::named_params;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::tracker::EgressTracker;
use crate::{JOB_MAX_RETRIES, JOB_TIMEOUT};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS egress_jobs(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_cid TEXT NOT NULL UNIQUE,
  payload TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  claimed INTEGER NOT NULL DEFAULT 0,
  not_before TIMESTAMP,
  created_at TIMESTAMP NOT NULL
);
"#;

/// JSON payload of one tracking job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackJob {
    pub batch: String,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    workers: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobQueue {
    pub fn new(db: Db) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            db,
            workers,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub async fn migrate(&self) -> DbResult<()> {
        self.db.migrate(SCHEMA).await?;
        // Claims do not survive a restart.
        self.db
            .with_conn(|conn| {
                conn.execute("UPDATE egress_jobs SET claimed = 0 WHERE claimed = 1", [])?;
                Ok(())
            })
            .await
    }

    /// Enqueue a batch for tracking. Duplicate cids are already queued
    /// and ignored.
    pub async fn enqueue(&self, batch: &Cid) -> DbResult<()> {
        let job = TrackJob {
            batch: batch.to_string(),
        };
        let payload = serde_json::to_string(&job)
            .map_err(|err| piri_db::DbError::Other(anyhow::anyhow!(err)))?;
        let key = job.batch.clone();
        let result = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO egress_jobs (batch_cid, payload, created_at)
                     VALUES (:cid, :payload, :now)",
                    named_params! { ":cid": key, ":payload": payload, ":now": Utc::now() },
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {
                debug!(batch = %batch, "tracking job queued");
                Ok(())
            }
            Err(err) if err.is_unique_violation() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn pending(&self) -> DbResult<i64> {
        self.db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM egress_jobs", [], |row| row.get(0))?)
            })
            .await
    }

    /// Launch one worker loop per core.
    pub fn run(&self, handler: Arc<dyn EgressTracker>) {
        for worker in 0..self.workers {
            let queue = self.clone();
            let handler = handler.clone();
            self.tracker.spawn(async move {
                queue.worker_loop(worker, handler).await;
            });
        }
    }

    pub async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .map_err(|_| anyhow::anyhow!("egress job queue stop timed out"))?;
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, handler: Arc<dyn EgressTracker>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
            match self.claim_next().await {
                Ok(Some(job)) => self.run_job(worker, &handler, job).await,
                Ok(None) => {}
                Err(err) => warn!(worker, %err, "job claim failed"),
            }
        }
    }

    async fn claim_next(&self) -> DbResult<Option<(i64, TrackJob, u32)>> {
        self.db
            .with_conn(move |conn| {
                let now = Utc::now();
                let row: Option<(i64, String, u32)> = conn
                    .query_row(
                        "SELECT id, payload, attempts FROM egress_jobs
                         WHERE claimed = 0 AND (not_before IS NULL OR not_before <= :now)
                         ORDER BY id ASC LIMIT 1",
                        named_params! { ":now": now },
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some((id, payload, attempts)) = row else {
                    return Ok(None);
                };
                let claimed = conn.execute(
                    "UPDATE egress_jobs SET claimed = 1 WHERE id = :id AND claimed = 0",
                    named_params! { ":id": id },
                )?;
                if claimed != 1 {
                    return Ok(None);
                }
                let job: TrackJob = serde_json::from_str(&payload)
                    .map_err(|err| piri_db::DbError::Other(anyhow::anyhow!(err)))?;
                Ok(Some((id, job, attempts)))
            })
            .await
    }

    async fn run_job(&self, worker: usize, handler: &Arc<dyn EgressTracker>, job: (i64, TrackJob, u32)) {
        let (id, job, attempts) = job;
        let outcome = match job.batch.parse::<Cid>() {
            Ok(batch) => match tokio::time::timeout(JOB_TIMEOUT, handler.track(&batch)).await {
                Ok(Ok(receipt)) if receipt.ok() => Ok(()),
                Ok(Ok(receipt)) => Err(anyhow::anyhow!(
                    "tracker reported {} failures",
                    receipt.errors.len()
                )),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(anyhow::anyhow!("tracking timed out")),
            },
            Err(err) => Err(anyhow::anyhow!("corrupt job payload: {err}")),
        };

        let result = match outcome {
            Ok(()) => {
                info!(worker, batch = %job.batch, "batch tracked");
                self.finish(id).await
            }
            Err(err) if attempts + 1 >= JOB_MAX_RETRIES => {
                error!(worker, batch = %job.batch, attempts = attempts + 1, %err,
                       "tracking job exhausted, dropping");
                self.finish(id).await
            }
            Err(err) => {
                warn!(worker, batch = %job.batch, attempts = attempts + 1, %err,
                      "tracking failed, will retry");
                self.release(id, attempts + 1).await
            }
        };
        if let Err(err) = result {
            error!(worker, job = id, %err, "job bookkeeping failed");
        }
    }

    async fn finish(&self, id: i64) -> DbResult<()> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM egress_jobs WHERE id = :id",
                    named_params! { ":id": id },
                )?;
                Ok(())
            })
            .await
    }

    async fn release(&self, id: i64, attempts: u32) -> DbResult<()> {
        let not_before: DateTime<Utc> = Utc::now()
            + chrono::Duration::from_std(retry_delay(attempts)).unwrap_or_default();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE egress_jobs
                     SET claimed = 0, attempts = :attempts, not_before = :not_before
                     WHERE id = :id",
                    named_params! { ":attempts": attempts, ":not_before": not_before, ":id": id },
                )?;
                Ok(())
            })
            .await
    }
}

/// Exponential delay for the nth retry, capped at the backoff policy's
/// maximum.
fn retry_delay(attempt: u32) -> Duration {
    let mut backoff = piri_db::tx_backoff();
    let mut delay = Duration::from_millis(50);
    for _ in 0..attempt {
        delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
    }
    delay
}
