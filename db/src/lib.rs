//! SQLite access layer shared by every piri subsystem.
//!
//! One connection guarded by an async mutex is the source of truth; all
//! multi-step state transitions run inside explicit transactions obtained
//! from [`Db::with_tx`] or [`Db::retry_tx`]. Lock contention is
//! distinguishable from other failures and retried with capped exponential
//! backoff; unique-constraint violations are distinguishable so callers can
//! treat duplicate inserts as benign.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::warn;

/// Attempts for a transaction that keeps hitting `SQLITE_BUSY`.
const MAX_TX_ATTEMPTS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Producer-side signal that the surrounding transaction must roll
    /// back without an insert having happened. Never surfaced to callers
    /// of the adder.
    #[error("transaction intentionally aborted")]
    Aborted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sql(e) => is_busy(e),
            DbError::Other(e) => e.downcast_ref::<rusqlite::Error>().is_some_and(is_busy),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Sql(e) => is_unique_violation(e),
            DbError::Other(e) => e
                .downcast_ref::<rusqlite::Error>()
                .is_some_and(is_unique_violation),
            _ => false,
        }
    }
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED`: another writer holds the file.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// UNIQUE or PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

/// Backoff schedule for busy transactions: 50 ms doubling, capped at 1 s.
pub fn tx_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(50),
        initial_interval: Duration::from_millis(50),
        multiplier: 2.0,
        max_interval: Duration::from_secs(1),
        max_elapsed_time: None,
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open the database at `path`, creating it if absent.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> DbResult<()> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        Ok(())
    }

    /// Install a subsystem's schema. Statements are expected to be
    /// `CREATE ... IF NOT EXISTS` so installation is idempotent.
    pub async fn migrate(&self, sql: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run `f` with the raw connection.
    pub async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction: commit on `Ok`, roll back
    /// on any error (including [`DbError::Aborted`]).
    pub async fn with_tx<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction) -> DbResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Drop rolls back; do it explicitly so a rollback failure
                // is not silently swallowed over the original error.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    /// [`Db::with_tx`], retried with exponential backoff while the
    /// database is busy, up to [`MAX_TX_ATTEMPTS`] attempts.
    pub async fn retry_tx<T, F>(&self, f: F) -> DbResult<T>
    where
        F: Fn(&Transaction) -> DbResult<T>,
    {
        let mut backoff = tx_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.with_tx(&f).await {
                Err(err) if err.is_busy() && attempt < MAX_TX_ATTEMPTS => {
                    let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(attempt, ?wait, "database busy, retrying transaction");
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}
