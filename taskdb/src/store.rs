//! Row-level operations on the `task` and `task_history` tables.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use piri_db::{Db, DbResult};
use rusqlite::named_params;

use crate::{SessionId, TaskId};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  posted_at TIMESTAMP NOT NULL,
  update_at TIMESTAMP NOT NULL,
  added_by TEXT NOT NULL,
  session_id TEXT,
  retries INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS task_poll_idx ON task(name, session_id, update_at);

CREATE TABLE IF NOT EXISTS task_history(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  posted_at TIMESTAMP NOT NULL,
  work_start TIMESTAMP NOT NULL,
  work_end TIMESTAMP NOT NULL,
  result INTEGER NOT NULL,
  error TEXT NOT NULL DEFAULT '',
  completed_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS task_history_task_idx ON task_history(task_id);
"#;

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: TaskId,
    pub name: String,
    pub posted_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
    pub added_by: String,
    pub session_id: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct TaskHistoryRow {
    pub task_id: TaskId,
    pub name: String,
    pub posted_at: DateTime<Utc>,
    pub work_start: DateTime<Utc>,
    pub work_end: DateTime<Utc>,
    pub result: bool,
    pub error: String,
    pub completed_by: String,
}

pub async fn migrate(db: &Db) -> DbResult<()> {
    db.migrate(SCHEMA).await
}

/// Unclaimed candidate ids for one task type, oldest update first. When a
/// retry backoff is configured, rows updated within the backoff of `now`
/// are skipped.
pub async fn candidates(
    db: &Db,
    name: &str,
    min_wait: Option<std::time::Duration>,
    limit: u32,
) -> DbResult<Vec<TaskId>> {
    let cutoff = min_wait.map(|wait| {
        Utc::now() - ChronoDuration::from_std(wait).unwrap_or(ChronoDuration::zero())
    });
    let name = name.to_string();
    db.with_conn(move |conn| {
        let mut ids = Vec::new();
        match cutoff {
            Some(cutoff) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id FROM task
                     WHERE name = :name AND session_id IS NULL AND update_at <= :cutoff
                     ORDER BY update_at ASC LIMIT :limit",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":name": name, ":cutoff": cutoff, ":limit": limit },
                    |row| row.get(0),
                )?;
                for id in rows {
                    ids.push(id?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id FROM task
                     WHERE name = :name AND session_id IS NULL
                     ORDER BY update_at ASC LIMIT :limit",
                )?;
                let rows = stmt
                    .query_map(named_params! { ":name": name, ":limit": limit }, |row| {
                        row.get(0)
                    })?;
                for id in rows {
                    ids.push(id?);
                }
            }
        }
        Ok(ids)
    })
    .await
}

/// Conditionally claim a task for `session`. Returns false when another
/// engine won the race.
pub async fn claim(db: &Db, id: TaskId, session: SessionId) -> DbResult<bool> {
    db.with_conn(move |conn| {
        let affected = conn.execute(
            "UPDATE task SET session_id = :session, update_at = :now
             WHERE id = :id AND session_id IS NULL",
            named_params! { ":session": session.to_string(), ":now": Utc::now(), ":id": id },
        )?;
        Ok(affected == 1)
    })
    .await
}

/// Release every row owned by `session` (engine shutdown).
pub async fn release_session(db: &Db, session: SessionId) -> DbResult<usize> {
    db.with_conn(move |conn| {
        Ok(conn.execute(
            "UPDATE task SET session_id = NULL, update_at = :now
             WHERE session_id = :session",
            named_params! { ":now": Utc::now(), ":session": session.to_string() },
        )?)
    })
    .await
}

/// Release every row owned by any session other than ours (engine
/// startup). Adopts orphans left by crashed predecessors.
pub async fn release_other_sessions(db: &Db, ours: SessionId) -> DbResult<usize> {
    db.with_conn(move |conn| {
        Ok(conn.execute(
            "UPDATE task SET session_id = NULL, update_at = :now
             WHERE session_id IS NOT NULL AND session_id != :ours",
            named_params! { ":now": Utc::now(), ":ours": ours.to_string() },
        )?)
    })
    .await
}

pub struct Completion {
    pub id: TaskId,
    pub name: &'static str,
    pub session: SessionId,
    pub work_start: DateTime<Utc>,
    pub work_end: DateTime<Utc>,
    /// Task is finished regardless of retries (success or non-failing
    /// error).
    pub done: bool,
    pub error: Option<String>,
    /// 0 = unlimited retries.
    pub max_failures: u32,
}

/// Record one execution: append the history row and either delete the
/// task or release it with `retries + 1`, all in one transaction.
pub async fn complete(db: &Db, completion: Completion) -> DbResult<()> {
    db.retry_tx(move |tx| {
        let row: Option<(DateTime<Utc>, u32)> = tx
            .query_row(
                "SELECT posted_at, retries FROM task WHERE id = :id",
                named_params! { ":id": completion.id },
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        // The row can be gone if another engine deleted it after our
        // session was force-released; history still records the attempt.
        let (posted_at, retries) = row.unwrap_or((completion.work_start, 0));

        let result_ok = completion.done && completion.error.is_none();
        tx.execute(
            "INSERT INTO task_history
               (task_id, name, posted_at, work_start, work_end, result, error, completed_by)
             VALUES (:task_id, :name, :posted_at, :work_start, :work_end, :result, :error, :completed_by)",
            named_params! {
                ":task_id": completion.id,
                ":name": completion.name,
                ":posted_at": posted_at,
                ":work_start": completion.work_start,
                ":work_end": completion.work_end,
                ":result": result_ok,
                ":error": completion.error.as_deref().unwrap_or(""),
                ":completed_by": completion.session.to_string(),
            },
        )?;

        let exhausted =
            !completion.done && completion.max_failures > 0 && retries >= completion.max_failures;
        if completion.done || exhausted {
            tx.execute(
                "DELETE FROM task WHERE id = :id",
                named_params! { ":id": completion.id },
            )?;
        } else {
            tx.execute(
                "UPDATE task SET session_id = NULL, retries = retries + 1, update_at = :now
                 WHERE id = :id AND session_id = :session",
                named_params! {
                    ":now": Utc::now(),
                    ":id": completion.id,
                    ":session": completion.session.to_string(),
                },
            )?;
        }
        Ok(())
    })
    .await
}

/// Total live task rows.
pub async fn count_tasks(db: &Db) -> DbResult<i64> {
    db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM task", [], |row| row.get(0))?))
        .await
}

/// Live task rows owned by one session.
pub async fn count_owned_by(db: &Db, session: SessionId) -> DbResult<i64> {
    db.with_conn(move |conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM task WHERE session_id = :session",
            named_params! { ":session": session.to_string() },
            |row| row.get(0),
        )?)
    })
    .await
}

pub async fn get_task(db: &Db, id: TaskId) -> DbResult<Option<TaskRow>> {
    db.with_conn(move |conn| {
        conn.query_row(
            "SELECT id, name, posted_at, update_at, added_by, session_id, retries
             FROM task WHERE id = :id",
            named_params! { ":id": id },
            |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    posted_at: row.get(2)?,
                    update_at: row.get(3)?,
                    added_by: row.get(4)?,
                    session_id: row.get(5)?,
                    retries: row.get(6)?,
                })
            },
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    })
    .await
}

/// Operator/debugging surface: every recorded execution of one task.
pub async fn history_for_task(db: &Db, task_id: TaskId) -> DbResult<Vec<TaskHistoryRow>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT task_id, name, posted_at, work_start, work_end, result, error, completed_by
             FROM task_history WHERE task_id = :task_id ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(named_params! { ":task_id": task_id }, history_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn recent_history(db: &Db, limit: u32) -> DbResult<Vec<TaskHistoryRow>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT task_id, name, posted_at, work_start, work_end, result, error, completed_by
             FROM task_history ORDER BY id DESC LIMIT :limit",
        )?;
        let rows = stmt.query_map(named_params! { ":limit": limit }, history_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskHistoryRow> {
    Ok(TaskHistoryRow {
        task_id: row.get(0)?,
        name: row.get(1)?,
        posted_at: row.get(2)?,
        work_start: row.get(3)?,
        work_end: row.get(4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        completed_by: row.get(7)?,
    })
}
