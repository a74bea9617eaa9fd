//! Durable, session-owned task scheduling over the shared SQLite store.
//!
//! Tasks exist as rows only while uncompleted; completion (success or
//! retry exhaustion) deletes the row in the same transaction that appends
//! its history record. Ownership is a session id stamped on claimed rows,
//! which lets a restarted node adopt a crashed predecessor's work without
//! any leader election.

mod adder;
mod engine;
mod store;

pub use adder::TaskAdder;
pub use engine::{TaskEngine, POLL_IDLE_WAIT, POLL_NEXT_WAIT};
pub use store::{
    count_owned_by, count_tasks, get_task, history_for_task, recent_history, TaskHistoryRow,
    TaskRow,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Row id of a task. Monotonic per store; never reused.
pub type TaskId = i64;

/// Unique per-engine-process token stamped on claimed task rows.
/// Time-ordered so orphan rows sort by the age of their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn mint() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Static description of a task type, queried once at registration.
#[derive(Clone)]
pub struct TaskTypeDetails {
    pub name: &'static str,
    /// Failures allowed before the task is deleted; 0 = unlimited.
    pub max_failures: u32,
    /// Minimum wait before a failed task is offered again, as a function
    /// of the retry count.
    pub retry_wait: Option<fn(u32) -> Duration>,
    /// If set, `schedule` is invoked on this interval.
    pub periodic: Option<Duration>,
}

impl TaskTypeDetails {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            max_failures: 0,
            retry_wait: None,
            periodic: None,
        }
    }
}

/// Outcome of one `do_work` invocation.
pub enum TaskResult {
    /// The task is complete and its row is deleted. A carried error is
    /// recorded in history as a non-failing error.
    Done(Option<anyhow::Error>),
    /// The task is released for a later retry, subject to `max_failures`.
    Retry(anyhow::Error),
}

/// A task type the engine knows how to run. Implementations decide their
/// own internal concurrency; the row-level claim already guarantees a
/// given task id runs on at most one engine at a time.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    fn details(&self) -> TaskTypeDetails;

    /// Called once at engine start with the adder producers use to
    /// enqueue tasks of this type. Handlers without producers ignore it.
    fn register_adder(&self, _adder: TaskAdder) {}

    /// Run one claimed task. `cancel` follows the engine's lifetime;
    /// handlers doing long waits should return `Retry` once it fires so
    /// the row is released rather than completed.
    async fn do_work(&self, id: TaskId, cancel: CancellationToken) -> TaskResult;

    /// Periodic producer hook, invoked on `details().periodic` if set.
    async fn schedule(&self, _adder: &TaskAdder) -> anyhow::Result<()> {
        Ok(())
    }
}
