//! End-to-end tests for the task engine: retry exhaustion, session
//! handoff, shutdown release, adder gating, and periodic producers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use piri_db::{Db, DbResult};
use piri_tasks::{
    count_owned_by, count_tasks, history_for_task, SessionId, TaskAdder, TaskEngine, TaskHandler,
    TaskId, TaskResult, TaskTypeDetails,
};
use rusqlite::named_params;
use tokio_util::sync::CancellationToken;

fn fifty_ms(_retries: u32) -> Duration {
    Duration::from_millis(50)
}

/// Completes every task it is given and remembers which.
struct CountingHandler {
    name: &'static str,
    seen: Mutex<Vec<TaskId>>,
    adder: OnceLock<TaskAdder>,
}

impl CountingHandler {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            seen: Mutex::new(Vec::new()),
            adder: OnceLock::new(),
        })
    }

    fn adder(&self) -> &TaskAdder {
        self.adder.get().expect("engine not started")
    }
}

#[async_trait::async_trait]
impl TaskHandler for CountingHandler {
    fn details(&self) -> TaskTypeDetails {
        TaskTypeDetails::named(self.name)
    }

    fn register_adder(&self, adder: TaskAdder) {
        let _ = self.adder.set(adder);
    }

    async fn do_work(&self, id: TaskId, _cancel: CancellationToken) -> TaskResult {
        self.seen.lock().unwrap().push(id);
        TaskResult::Done(None)
    }
}

/// Fails every attempt with a numbered error.
struct FailingHandler {
    attempts: AtomicU32,
    adder: OnceLock<TaskAdder>,
}

impl FailingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            adder: OnceLock::new(),
        })
    }
}

#[async_trait::async_trait]
impl TaskHandler for FailingHandler {
    fn details(&self) -> TaskTypeDetails {
        TaskTypeDetails {
            name: "AlwaysFails",
            max_failures: 3,
            retry_wait: Some(fifty_ms),
            periodic: None,
        }
    }

    fn register_adder(&self, adder: TaskAdder) {
        let _ = self.adder.set(adder);
    }

    async fn do_work(&self, _id: TaskId, _cancel: CancellationToken) -> TaskResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        TaskResult::Retry(anyhow!("boom attempt {attempt}"))
    }
}

/// Enqueues one task per periodic tick.
struct PeriodicHandler {
    ran: AtomicU32,
}

#[async_trait::async_trait]
impl TaskHandler for PeriodicHandler {
    fn details(&self) -> TaskTypeDetails {
        TaskTypeDetails {
            name: "Periodic",
            max_failures: 0,
            retry_wait: None,
            periodic: Some(Duration::from_millis(50)),
        }
    }

    async fn do_work(&self, _id: TaskId, _cancel: CancellationToken) -> TaskResult {
        self.ran.fetch_add(1, Ordering::SeqCst);
        TaskResult::Done(None)
    }

    async fn schedule(&self, adder: &TaskAdder) -> anyhow::Result<()> {
        adder.add_plain().await?;
        Ok(())
    }
}

async fn wait_for<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn temp_db(dir: &tempfile::TempDir) -> Db {
    Db::open(&dir.path().join("tasks.sqlite")).unwrap()
}

#[tokio::test]
async fn completes_and_records_history() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    let handler = CountingHandler::new("Simple");
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();

    let id = handler.adder().add_plain().await.unwrap().unwrap();
    assert!(
        wait_for(
            || async { count_tasks(&db).await.unwrap() == 0 },
            Duration::from_secs(10),
        )
        .await,
        "task never completed"
    );

    let history = history_for_task(&db, id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].result);
    assert_eq!(history[0].error, "");
    assert_eq!(history[0].completed_by, engine.session_id().to_string());
    assert_eq!(*handler.seen.lock().unwrap(), vec![id]);

    engine.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn retries_then_exhausts() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    let handler = FailingHandler::new();
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();

    let id = handler
        .adder
        .get()
        .unwrap()
        .add_plain()
        .await
        .unwrap()
        .unwrap();

    // max_failures = 3 allows three retries after the first failure.
    assert!(
        wait_for(
            || async { count_tasks(&db).await.unwrap() == 0 },
            Duration::from_secs(30),
        )
        .await,
        "task was never exhausted"
    );

    let history = history_for_task(&db, id).await.unwrap();
    assert_eq!(history.len(), 4);
    for (i, row) in history.iter().enumerate() {
        assert!(!row.result);
        assert_eq!(row.error, format!("error: boom attempt {}", i + 1));
    }
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 4);

    engine.stop(Duration::from_secs(5)).await.unwrap();
}

/// Completes on the first attempt but carries an error worth recording.
struct GrumblingHandler {
    adder: OnceLock<TaskAdder>,
}

#[async_trait::async_trait]
impl TaskHandler for GrumblingHandler {
    fn details(&self) -> TaskTypeDetails {
        TaskTypeDetails {
            name: "Grumbling",
            max_failures: 3,
            retry_wait: None,
            periodic: None,
        }
    }

    fn register_adder(&self, adder: TaskAdder) {
        let _ = self.adder.set(adder);
    }

    async fn do_work(&self, _id: TaskId, _cancel: CancellationToken) -> TaskResult {
        TaskResult::Done(Some(anyhow!("partial result")))
    }
}

#[tokio::test]
async fn non_failing_error_completes_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    let handler = Arc::new(GrumblingHandler {
        adder: OnceLock::new(),
    });
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();

    let id = handler
        .adder
        .get()
        .unwrap()
        .add_plain()
        .await
        .unwrap()
        .unwrap();
    assert!(
        wait_for(
            || async { count_tasks(&db).await.unwrap() == 0 },
            Duration::from_secs(10),
        )
        .await,
        "task never completed"
    );

    // One attempt, recorded with the error, no retries burned.
    let history = history_for_task(&db, id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].result);
    assert_eq!(history[0].error, "error: partial result");

    engine.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn adopts_rows_from_crashed_session() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);

    // Engine A claims a task and "crashes" (no stop, no poller).
    let ghost = SessionId::mint();
    {
        let handler = CountingHandler::new("Handoff");
        let engine_a = TaskEngine::with_session(db.clone(), vec![handler.clone()], ghost);
        // Only migrate + wire; never let A poll.
        engine_a.start().await.unwrap();
        engine_a.stop(Duration::from_secs(5)).await.unwrap();
        handler.adder().add_plain().await.unwrap().unwrap();
    }
    claim_raw(&db, ghost).await;

    let handler_b = CountingHandler::new("Handoff");
    let engine_b = TaskEngine::new(db.clone(), vec![handler_b.clone()]);
    engine_b.start().await.unwrap();

    assert!(
        wait_for(
            || async { count_tasks(&db).await.unwrap() == 0 },
            Duration::from_secs(15),
        )
        .await,
        "orphaned task never adopted"
    );
    assert_eq!(count_owned_by(&db, ghost).await.unwrap(), 0);

    let seen = handler_b.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let history = history_for_task(&db, seen[0]).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].completed_by, engine_b.session_id().to_string());

    engine_b.stop(Duration::from_secs(5)).await.unwrap();
}

/// Stamp every unclaimed row with `session` without running an engine.
async fn claim_raw(db: &Db, session: SessionId) {
    let marked: DbResult<usize> = db
        .with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE task SET session_id = :session WHERE session_id IS NULL",
                named_params! { ":session": session.to_string() },
            )?)
        })
        .await;
    assert!(marked.unwrap() > 0);
}

#[tokio::test]
async fn stop_releases_owned_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    let handler = CountingHandler::new("StopRelease");
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();

    for _ in 0..5 {
        handler.adder().add_plain().await.unwrap();
    }
    engine.stop(Duration::from_secs(5)).await.unwrap();

    assert_eq!(count_owned_by(&db, engine.session_id()).await.unwrap(), 0);
}

#[tokio::test]
async fn adder_gating_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    db.migrate("CREATE TABLE IF NOT EXISTS gate(slot INTEGER UNIQUE NOT NULL);")
        .await
        .unwrap();
    let handler = CountingHandler::new("Gated");
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();
    // Stop the poller so rows stay put while we assert on them.
    engine.stop(Duration::from_secs(5)).await.unwrap();

    // Producer aborts: no task row is created.
    let aborted = handler.adder().add(|_, _| Ok(false)).await.unwrap();
    assert_eq!(aborted, None);
    assert_eq!(count_tasks(&db).await.unwrap(), 0);

    // First gated insert succeeds, duplicate is swallowed.
    fn gated(_id: TaskId, tx: &rusqlite::Transaction) -> DbResult<bool> {
        tx.execute("INSERT INTO gate(slot) VALUES (1)", [])?;
        Ok(true)
    }
    let first = handler.adder().add(gated).await.unwrap();
    assert!(first.is_some());
    let second = handler.adder().add(gated).await.unwrap();
    assert_eq!(second, None);
    assert_eq!(count_tasks(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn periodic_producer_enqueues() {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(&dir);
    let handler = Arc::new(PeriodicHandler {
        ran: AtomicU32::new(0),
    });
    let engine = TaskEngine::new(db.clone(), vec![handler.clone()]);
    engine.start().await.unwrap();

    assert!(
        wait_for(
            || async { handler.ran.load(Ordering::SeqCst) >= 2 },
            Duration::from_secs(10),
        )
        .await,
        "periodic tasks never ran"
    );

    engine.stop(Duration::from_secs(5)).await.unwrap();
}
