use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use piri_db::{Db, DbResult};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::store::{self, Completion};
use crate::{SessionId, TaskAdder, TaskHandler, TaskId, TaskResult, TaskTypeDetails};

/// Poll delay after a cycle that found work.
pub const POLL_NEXT_WAIT: Duration = Duration::from_millis(100);
/// Poll delay after an idle cycle.
pub const POLL_IDLE_WAIT: Duration = Duration::from_secs(3);

/// How many unclaimed candidates one poll offers to a handler.
const CANDIDATE_LIMIT: u32 = 32;

/// The polling scheduler. Cheap to clone; all clones share the session,
/// the cancellation token, and the in-flight task tracker.
#[derive(Clone)]
pub struct TaskEngine {
    db: Db,
    session: SessionId,
    handlers: Arc<Vec<Arc<dyn TaskHandler>>>,
    details: Arc<Vec<TaskTypeDetails>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskEngine {
    pub fn new(db: Db, handlers: Vec<Arc<dyn TaskHandler>>) -> Self {
        Self::with_session(db, handlers, SessionId::mint())
    }

    /// Construct with a caller-supplied session id (tests exercising
    /// handoff between named sessions).
    pub fn with_session(db: Db, handlers: Vec<Arc<dyn TaskHandler>>, session: SessionId) -> Self {
        let details = handlers.iter().map(|h| h.details()).collect();
        Self {
            db,
            session,
            handlers: Arc::new(handlers),
            details: Arc::new(details),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Migrate the schema, adopt orphaned rows, wire adders and periodic
    /// runners, and launch the poller. Returns once startup is done;
    /// ongoing work runs on background tasks until [`TaskEngine::stop`].
    pub async fn start(&self) -> DbResult<()> {
        store::migrate(&self.db).await?;

        let released = store::release_other_sessions(&self.db, self.session).await?;
        if released > 0 {
            info!(released, "adopted task rows from previous sessions");
        }

        for (handler, details) in self.handlers.iter().zip(self.details.iter()) {
            handler.register_adder(TaskAdder::new(self.db.clone(), details.name, self.session));
            if let Some(interval) = details.periodic {
                self.spawn_periodic(handler.clone(), details.name, interval);
            }
        }

        let engine = self.clone();
        self.tracker.spawn(async move { engine.poll_loop().await });
        info!(session = %self.session, "task engine started");
        Ok(())
    }

    /// Cancel background work, release this session's rows, and wait for
    /// in-flight handlers up to `timeout`. Handlers are never killed; a
    /// timeout surfaces as an error while they drain in the background.
    pub async fn stop(&self, timeout: Duration) -> DbResult<()> {
        self.cancel.cancel();
        let released = store::release_session(&self.db, self.session).await?;
        debug!(released, session = %self.session, "released task rows");

        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .map_err(|_| {
                piri_db::DbError::Other(anyhow!(
                    "task engine stop timed out with handlers in flight"
                ))
            })?;
        info!(session = %self.session, "task engine stopped");
        Ok(())
    }

    fn spawn_periodic(&self, handler: Arc<dyn TaskHandler>, name: &'static str, every: Duration) {
        let adder = TaskAdder::new(self.db.clone(), name, self.session);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = handler.schedule(&adder).await {
                            warn!(task = name, %err, "periodic scheduler failed");
                        }
                    }
                }
            }
        });
    }

    async fn poll_loop(&self) {
        let mut wait = POLL_NEXT_WAIT;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = match self.poll_once().await {
                Ok(true) => POLL_NEXT_WAIT,
                Ok(false) => POLL_IDLE_WAIT,
                Err(err) => {
                    warn!(%err, "task poll failed");
                    POLL_IDLE_WAIT
                }
            };
        }
    }

    /// One poll cycle: offer each handler, in registration order, its
    /// oldest unclaimed rows. Returns true once any handler accepts work.
    async fn poll_once(&self) -> DbResult<bool> {
        for (idx, details) in self.details.iter().enumerate() {
            let min_wait = details.retry_wait.map(|wait| wait(0));
            let ids =
                store::candidates(&self.db, details.name, min_wait, CANDIDATE_LIMIT).await?;
            if ids.is_empty() {
                continue;
            }
            if self.consider_work(idx, &ids).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim ids one at a time; the first successful claim spawns the
    /// handler and wins the cycle. Zero rows affected means another
    /// engine got there first.
    async fn consider_work(&self, idx: usize, ids: &[TaskId]) -> DbResult<bool> {
        for &id in ids {
            if store::claim(&self.db, id, self.session).await? {
                let engine = self.clone();
                self.tracker.spawn(async move { engine.run_one(idx, id).await });
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Execute one claimed task and record the outcome. Every path writes
    /// a history row; panics in the handler count as retryable failures.
    async fn run_one(&self, idx: usize, id: TaskId) {
        let handler = self.handlers[idx].clone();
        let details = &self.details[idx];
        let work_start = Utc::now();
        debug!(task = details.name, id, "task started");

        let cancel = self.cancel.clone();
        let joined = tokio::spawn(async move { handler.do_work(id, cancel).await }).await;
        let result = match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                error!(task = details.name, id, "task handler panicked");
                TaskResult::Retry(anyhow!("task handler panicked: {err}"))
            }
            Err(err) => TaskResult::Retry(anyhow!("task handler aborted: {err}")),
        };

        let (done, error) = match result {
            TaskResult::Done(None) => (true, None),
            TaskResult::Done(Some(err)) => (true, Some(format!("error: {err:#}"))),
            TaskResult::Retry(err) => (false, Some(format!("error: {err:#}"))),
        };
        if let Some(message) = &error {
            warn!(task = details.name, id, done, message, "task errored");
        } else {
            debug!(task = details.name, id, "task done");
        }

        let completion = Completion {
            id,
            name: details.name,
            session: self.session,
            work_start,
            work_end: Utc::now(),
            done,
            error,
            max_failures: details.max_failures,
        };
        if let Err(err) = store::complete(&self.db, completion).await {
            error!(task = details.name, id, %err, "failed to record task completion");
        }
    }
}
