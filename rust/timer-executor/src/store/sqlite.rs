//! `SQLite` backend for timer definitions and task records.
//!
//! Each operation opens its own connection on the blocking thread pool;
//! WAL mode lets concurrent workers read while another one writes.
//!
//! # Example
//!
//! ```rust,ignore
//! use timer_executor::store::SqliteStore;
//!
//! let store = SqliteStore::new("./data/timers.db").await?;
//! let timer = store.get_timer(42).await?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;

use super::{TaskStore, TimerStore};
use crate::error::{ExecutorError, ExecutorResult};
use crate::key::TaskKey;
use crate::model::{NotifyParam, TaskRecord, TaskStatus, TimerDefinition, TimerStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`TimerStore`] and [`TaskStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// Path to the database file.
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate the schema.
    pub async fn new<P: Into<PathBuf>>(path: P) -> ExecutorResult<Self> {
        let store = Self {
            db_path: path.into(),
        };
        store.migrate_schema().await?;
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> ExecutorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ExecutorResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .with_context(|| format!("Failed to open task database {}", db_path.display()))
                .map_err(storage)?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .context("Failed to set busy timeout")
                .map_err(storage)?;
            f(&conn)
        })
        .await
        .map_err(|e| ExecutorError::Storage(format!("blocking task failed: {e}")))?
    }

    async fn migrate_schema(&self) -> ExecutorResult<()> {
        self.with_conn(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")
                .map_err(storage)?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS timers (
                    id INTEGER PRIMARY KEY,
                    app TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    notify_http_param TEXT NOT NULL
                )
                ",
                [],
            )
            .context("Failed to create timers table")
            .map_err(storage)?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timer_id INTEGER NOT NULL,
                    app TEXT NOT NULL,
                    run_timer INTEGER NOT NULL,
                    status INTEGER NOT NULL,
                    output TEXT NOT NULL DEFAULT '',
                    cost_time INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    UNIQUE(timer_id, run_timer)
                )
                ",
                [],
            )
            .context("Failed to create tasks table")
            .map_err(storage)?;

            Ok(())
        })
        .await
    }

    /// Insert or replace a timer definition.
    pub async fn insert_timer(&self, timer: &TimerDefinition) -> ExecutorResult<()> {
        let id = to_sql_id(timer.id)?;
        let app = timer.app.clone();
        let name = timer.name.clone();
        let status = timer.status.as_i64();
        let param = serde_json::to_string(&timer.notify_http_param)?;

        self.with_conn(move |conn| {
            conn.execute(
                r"
                INSERT OR REPLACE INTO timers (id, app, name, status, notify_http_param)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![id, app, name, status, param],
            )?;
            Ok(())
        })
        .await
    }

    /// Create a `NotRun` record, as the scheduling producer does.
    ///
    /// Returns `false` if a record for the same occurrence already exists.
    pub async fn insert_task(&self, key: TaskKey, app: &str) -> ExecutorResult<bool> {
        let timer_id = to_sql_id(key.timer_id)?;
        let app = app.to_string();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                r"
                INSERT OR IGNORE INTO tasks (timer_id, app, run_timer, status)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![timer_id, app, key.run_unix_millis, TaskStatus::NotRun.as_i64()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }
}

/// Keep the context chain but classify as a storage failure.
#[allow(clippy::needless_pass_by_value, reason = "used as a map_err adapter")]
fn storage(err: anyhow::Error) -> ExecutorError {
    ExecutorError::Storage(format!("{err:#}"))
}

fn to_sql_id(id: u64) -> ExecutorResult<i64> {
    i64::try_from(id).map_err(|e| ExecutorError::Storage(format!("timer id {id} out of range: {e}")))
}

fn from_sql_id(id: i64) -> rusqlite::Result<u64> {
    u64::try_from(id).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, id))
}

type TimerRow = (u64, String, String, i64, String);
type TaskRow = (u64, String, i64, i64, String, i64, Option<String>);

fn timer_from_row(row: &Row<'_>) -> rusqlite::Result<TimerRow> {
    Ok((
        from_sql_id(row.get(0)?)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        from_sql_id(row.get(0)?)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

#[async_trait]
impl TimerStore for SqliteStore {
    async fn get_timer(&self, timer_id: u64) -> ExecutorResult<TimerDefinition> {
        let id = to_sql_id(timer_id)?;

        let row = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, app, name, status, notify_http_param FROM timers WHERE id = ?1",
                        params![id],
                        timer_from_row,
                    )
                    .optional()?)
            })
            .await?;

        let (id, app, name, status, param) = row.ok_or(ExecutorError::TimerNotFound { timer_id })?;
        let status = TimerStatus::from_i64(status)
            .ok_or_else(|| ExecutorError::Storage(format!("timer {id} has unknown status {status}")))?;
        let notify_http_param: NotifyParam = serde_json::from_str(&param)
            .map_err(|e| ExecutorError::Storage(format!("timer {id} has invalid notify param: {e}")))?;

        Ok(TimerDefinition {
            id,
            name,
            app,
            status,
            notify_http_param,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn get_task(&self, key: TaskKey) -> ExecutorResult<Option<TaskRecord>> {
        let timer_id = to_sql_id(key.timer_id)?;

        let row = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        r"
                        SELECT timer_id, app, run_timer, status, output, cost_time, error
                        FROM tasks WHERE timer_id = ?1 AND run_timer = ?2
                        ",
                        params![timer_id, key.run_unix_millis],
                        task_from_row,
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(timer_id, app, run_timer, status, output, cost_time, error)| {
            let status = TaskStatus::from_i64(status).ok_or_else(|| {
                ExecutorError::Storage(format!("task {key} has unknown status {status}"))
            })?;
            Ok(TaskRecord {
                timer_id,
                app,
                run_timer,
                status,
                output,
                cost_time,
                error,
            })
        })
        .transpose()
    }

    async fn update_task(&self, record: &TaskRecord) -> ExecutorResult<()> {
        if record.status == TaskStatus::NotRun {
            return Err(ExecutorError::Storage(
                "task status cannot be reset to not_run".to_string(),
            ));
        }

        let timer_id = to_sql_id(record.timer_id)?;
        let record = record.clone();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                r"
                UPDATE tasks SET status = ?3, output = ?4, cost_time = ?5, error = ?6
                WHERE timer_id = ?1 AND run_timer = ?2
                ",
                params![
                    timer_id,
                    record.run_timer,
                    record.status.as_i64(),
                    record.output,
                    record.cost_time,
                    record.error,
                ],
            )?;
            if updated == 0 {
                return Err(ExecutorError::RecordNotFound {
                    timer_id: record.timer_id,
                    run_timer: record.run_timer,
                });
            }
            Ok(())
        })
        .await
    }
}
