use chrono::Utc;
use piri_db::{Db, DbError, DbResult};
use rusqlite::{named_params, Transaction};
use tracing::debug;

use crate::{SessionId, TaskId};

/// Enqueues tasks of one type. Handed to handlers at registration and to
/// periodic runners; cheap to clone.
#[derive(Clone)]
pub struct TaskAdder {
    db: Db,
    name: &'static str,
    session: SessionId,
}

impl TaskAdder {
    pub(crate) fn new(db: Db, name: &'static str, session: SessionId) -> Self {
        Self { db, name, session }
    }

    pub fn task_name(&self) -> &'static str {
        self.name
    }

    /// Insert a task row and run the producer's `extra` mutation in the
    /// same transaction. `extra` returning `Ok(false)` rolls the whole
    /// transaction back (the gating condition no longer holds); a
    /// unique-constraint violation from `extra` means the task is already
    /// enqueued. Both cases return `Ok(None)`. Lock contention retries the
    /// whole transaction via the store's capped exponential policy.
    pub async fn add<F>(&self, extra: F) -> DbResult<Option<TaskId>>
    where
        F: Fn(TaskId, &Transaction) -> DbResult<bool> + Send + Sync,
    {
        let name = self.name;
        let session = self.session;
        let result = self
            .db
            .retry_tx(move |tx| {
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO task (name, posted_at, update_at, added_by, retries)
                     VALUES (:name, :now, :now, :added_by, 0)",
                    named_params! { ":name": name, ":now": now, ":added_by": session.to_string() },
                )?;
                let id: TaskId = tx.last_insert_rowid();
                if extra(id, tx)? {
                    Ok(id)
                } else {
                    Err(DbError::Aborted)
                }
            })
            .await;

        match result {
            Ok(id) => Ok(Some(id)),
            Err(DbError::Aborted) => {
                debug!(task = self.name, "task insert aborted by producer");
                Ok(None)
            }
            Err(err) if err.is_unique_violation() => {
                debug!(task = self.name, "task already enqueued");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Enqueue with no producer-side state mutation.
    pub async fn add_plain(&self) -> DbResult<Option<TaskId>> {
        self.add(|_, _| Ok(true)).await
    }
}
