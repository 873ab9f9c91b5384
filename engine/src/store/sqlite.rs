//! SQLite-backed `TaskStore`.
//!
//! A single connection behind a lock, WAL mode for concurrent readers, and a
//! busy timeout so lock contention waits instead of failing immediately.
//! `rusqlite` is synchronous, so every query runs inside `spawn_blocking`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

use shared::{
    AuditLevel, ExecutionLogEntry, LogLevel, PersistedTask, RecurringSpec, TaskId, TaskStatus,
};

use crate::error::StoreError;
use super::{Page, TaskStore};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.into()))?;
        Self::configure_and_migrate(&conn)?;
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Backend(e.into()))?;
        Self::configure_and_migrate(&conn)?;
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    fn configure_and_migrate(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(|e| StoreError::Backend(e.into()))?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| StoreError::Backend(e.into()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(|e| StoreError::Backend(e.into()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_key TEXT,
                request_payload TEXT NOT NULL,
                request_type_name TEXT NOT NULL,
                handler_type_name TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_execution_utc TEXT,
                is_recurring INTEGER NOT NULL,
                recurring_spec TEXT,
                max_runs INTEGER,
                run_until_utc TEXT,
                current_run_count INTEGER NOT NULL,
                next_run_utc TEXT,
                audit_level TEXT NOT NULL,
                created_at_utc TEXT NOT NULL,
                last_execution_utc TEXT,
                exception TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_recovery ON tasks(created_at_utc, id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_task_key_active
                ON tasks(task_key)
                WHERE task_key IS NOT NULL
                  AND status NOT IN ('completed', 'failed', 'cancelled');

            CREATE TABLE IF NOT EXISTS status_audits (
                task_id TEXT NOT NULL,
                new_status TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL,
                exception TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_status_audits_task ON status_audits(task_id, updated_at_utc);

            CREATE TABLE IF NOT EXISTS run_audits (
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                executed_at_utc TEXT NOT NULL,
                exception TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_run_audits_task ON run_audits(task_id, executed_at_utc);

            CREATE TABLE IF NOT EXISTS execution_logs (
                task_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                timestamp_utc TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                exception_details TEXT,
                PRIMARY KEY (task_id, sequence_number)
            );

            CREATE TABLE IF NOT EXISTS skipped_occurrences (
                task_id TEXT NOT NULL,
                occurrence_utc TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::Backend(e.into()))?;

        info!("sqlite store schema ready");
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("blocking task panicked: {e}")))?
        .map_err(|e| StoreError::Backend(e.into()))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<PersistedTask> {
        let id: String = row.get("id")?;
        let recurring_spec_json: Option<String> = row.get("recurring_spec")?;
        let payload_json: String = row.get("request_payload")?;
        let status_str: String = row.get("status")?;
        let audit_level_str: String = row.get("audit_level")?;

        Ok(PersistedTask {
            id: id.parse::<TaskId>().unwrap_or_default(),
            task_key: row.get("task_key")?,
            request_payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
            request_type_name: row.get("request_type_name")?,
            handler_type_name: row.get("handler_type_name")?,
            queue_name: row.get("queue_name")?,
            status: status_str.parse().unwrap_or(TaskStatus::Failed),
            scheduled_execution_utc: parse_optional_datetime(row.get("scheduled_execution_utc")?),
            is_recurring: row.get::<_, i64>("is_recurring")? != 0,
            recurring_spec: recurring_spec_json.and_then(|s| serde_json::from_str::<RecurringSpec>(&s).ok()),
            max_runs: row.get("max_runs")?,
            run_until_utc: parse_optional_datetime(row.get("run_until_utc")?),
            current_run_count: row.get("current_run_count")?,
            next_run_utc: parse_optional_datetime(row.get("next_run_utc")?),
            audit_level: parse_audit_level(&audit_level_str),
            created_at_utc: parse_datetime(row.get("created_at_utc")?),
            last_execution_utc: parse_optional_datetime(row.get("last_execution_utc")?),
            exception: row.get("exception")?,
        })
    }
}

fn parse_datetime(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn parse_optional_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|dt| dt.with_timezone(&Utc))
}

fn parse_audit_level(s: &str) -> AuditLevel {
    match s {
        "none" => AuditLevel::None,
        "minimal" => AuditLevel::Minimal,
        "errors_only" => AuditLevel::ErrorsOnly,
        _ => AuditLevel::Full,
    }
}

fn audit_level_str(level: AuditLevel) -> &'static str {
    match level {
        AuditLevel::None => "none",
        AuditLevel::Full => "full",
        AuditLevel::Minimal => "minimal",
        AuditLevel::ErrorsOnly => "errors_only",
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn persist(&self, task: PersistedTask) -> Result<(), StoreError> {
        let id = task.id.to_string();
        let payload = serde_json::to_string(&task.request_payload).map_err(|e| StoreError::Backend(e.into()))?;
        let recurring_spec = match &task.recurring_spec {
            Some(spec) => Some(serde_json::to_string(spec).map_err(|e| StoreError::Backend(e.into()))?),
            None => None,
        };
        let task_key = task.task_key.clone();
        let task_key_for_closure = task_key.clone();

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO tasks (
                    id, task_key, request_payload, request_type_name, handler_type_name,
                    queue_name, status, scheduled_execution_utc, is_recurring, recurring_spec,
                    max_runs, run_until_utc, current_run_count, next_run_utc, audit_level,
                    created_at_utc, last_execution_utc, exception
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                "#,
                params![
                    id,
                    task_key_for_closure,
                    payload,
                    task.request_type_name,
                    task.handler_type_name,
                    task.queue_name,
                    task.status.as_str(),
                    task.scheduled_execution_utc.map(|dt| dt.to_rfc3339()),
                    task.is_recurring as i64,
                    recurring_spec,
                    task.max_runs,
                    task.run_until_utc.map(|dt| dt.to_rfc3339()),
                    task.current_run_count,
                    task.next_run_utc.map(|dt| dt.to_rfc3339()),
                    audit_level_str(task.audit_level),
                    task.created_at_utc.to_rfc3339(),
                    task.last_execution_utc.map(|dt| dt.to_rfc3339()),
                    task.exception,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| match &e {
            StoreError::Backend(inner)
                if task_key.is_some() && inner.to_string().contains("UNIQUE constraint failed") =>
            {
                StoreError::DuplicateTaskKey(task_key.clone().unwrap_or_default())
            }
            _ => e,
        })
    }

    async fn set_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        exception: Option<String>,
    ) -> Result<(), StoreError> {
        let id = task_id.to_string();
        let status_str = status.as_str().to_string();
        let now = Utc::now().to_rfc3339();
        let touches_last_execution = status.is_terminal() || status == TaskStatus::InProgress;

        let audit_level = self
            .with_conn({
                let id = id.clone();
                move |conn| {
                    conn.query_row("SELECT audit_level FROM tasks WHERE id = ?1", params![id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()
                }
            })
            .await?
            .map(|s| parse_audit_level(&s))
            .ok_or(StoreError::NotFound(task_id))?;

        let exception_clone = exception.clone();
        self.with_conn(move |conn| {
            if touches_last_execution {
                conn.execute(
                    "UPDATE tasks SET status = ?1, exception = ?2, last_execution_utc = ?3 WHERE id = ?4",
                    params![status_str, exception_clone, now, id],
                )?;
            } else {
                conn.execute(
                    "UPDATE tasks SET status = ?1, exception = ?2 WHERE id = ?3",
                    params![status_str, exception_clone, id],
                )?;
            }
            Ok(())
        })
        .await?;

        let is_error = matches!(status, TaskStatus::Failed) || exception.is_some();
        if audit_level.records_status(is_error) {
            let task_id_str = task_id.to_string();
            let status_str = status.as_str().to_string();
            let now = Utc::now().to_rfc3339();
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO status_audits (task_id, new_status, updated_at_utc, exception) VALUES (?1,?2,?3,?4)",
                    params![task_id_str, status_str, now, exception],
                )?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn update_current_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        duration_ms: Option<u64>,
        next_run_utc: Option<DateTime<Utc>>,
        exception: Option<String>,
    ) -> Result<(), StoreError> {
        let id = task_id.to_string();
        let audit_level = self
            .with_conn({
                let id = id.clone();
                move |conn| {
                    conn.query_row("SELECT audit_level FROM tasks WHERE id = ?1", params![id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()
                }
            })
            .await?
            .map(|s| parse_audit_level(&s))
            .ok_or(StoreError::NotFound(task_id))?;

        let status_str = status.as_str().to_string();
        let next_run_str = next_run_utc.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();
        let exception_for_update = exception.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                UPDATE tasks SET
                    current_run_count = current_run_count + 1,
                    next_run_utc = ?1,
                    status = ?2,
                    exception = ?3,
                    last_execution_utc = ?4
                WHERE id = ?5
                "#,
                params![next_run_str, status_str, exception_for_update, now, id],
            )?;
            Ok(())
        })
        .await?;

        let is_error = matches!(status, TaskStatus::Failed) || exception.is_some();
        if audit_level.records_run(is_error) {
            let task_id_str = task_id.to_string();
            let status_str = status.as_str().to_string();
            let now = Utc::now().to_rfc3339();
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO run_audits (task_id, status, executed_at_utc, exception, duration_ms) VALUES (?1,?2,?3,?4,?5)",
                    params![task_id_str, status_str, now, exception, duration_ms.map(|d| d as i64)],
                )?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn retrieve_pending(
        &self,
        cursor: Option<(DateTime<Utc>, TaskId)>,
        take: usize,
    ) -> Result<Page<PersistedTask>, StoreError> {
        let eligible_statuses = ["waiting_queue", "queued", "in_progress", "service_stopped", "pending"];
        let (cursor_created_at, cursor_id) = match cursor {
            Some((dt, id)) => (dt.to_rfc3339(), id.to_string()),
            None => (String::new(), String::new()),
        };
        let has_cursor = cursor.is_some();

        let items = self
            .with_conn(move |conn| {
                let placeholders = eligible_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT * FROM tasks WHERE status IN ({}) AND (?{n} = 0 OR (created_at_utc, id) > (?{n1}, ?{n2})) ORDER BY created_at_utc ASC, id ASC LIMIT ?{n3}",
                    placeholders,
                    n = eligible_statuses.len() + 1,
                    n1 = eligible_statuses.len() + 2,
                    n2 = eligible_statuses.len() + 3,
                    n3 = eligible_statuses.len() + 4,
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut param_values: Vec<&dyn rusqlite::ToSql> = eligible_statuses.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
                let has_cursor_flag: i64 = if has_cursor { 1 } else { 0 };
                param_values.push(&has_cursor_flag);
                param_values.push(&cursor_created_at);
                param_values.push(&cursor_id);
                let take_i64 = take as i64;
                param_values.push(&take_i64);

                let rows = stmt.query_map(param_values.as_slice(), SqliteStore::row_to_task)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let next_cursor = items.last().map(|t| (t.created_at_utc, t.id));
        Ok(Page { items, next_cursor })
    }

    async fn get_by_task_key(&self, task_key: &str) -> Result<Option<PersistedTask>, StoreError> {
        let task_key = task_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM tasks WHERE task_key = ?1", params![task_key], SqliteStore::row_to_task).optional()
        })
        .await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<PersistedTask>, StoreError> {
        let id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], SqliteStore::row_to_task).optional()
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<PersistedTask>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks")?;
            let rows = stmt.query_map([], SqliteStore::row_to_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), StoreError> {
        let id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            conn.execute("DELETE FROM status_audits WHERE task_id = ?1", params![id])?;
            conn.execute("DELETE FROM run_audits WHERE task_id = ?1", params![id])?;
            conn.execute("DELETE FROM execution_logs WHERE task_id = ?1", params![id])?;
            conn.execute("DELETE FROM skipped_occurrences WHERE task_id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn save_execution_logs(&self, entries: Vec<ExecutionLogEntry>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for entry in &entries {
                tx.execute(
                    "INSERT OR REPLACE INTO execution_logs (task_id, sequence_number, timestamp_utc, level, message, exception_details) VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        entry.task_id.to_string(),
                        entry.sequence_number as i64,
                        entry.timestamp_utc.to_rfc3339(),
                        log_level_str(entry.level),
                        entry.message,
                        entry.exception_details,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_execution_logs(&self, task_id: TaskId) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, sequence_number, timestamp_utc, level, message, exception_details FROM execution_logs WHERE task_id = ?1 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                let task_id_str: String = row.get(0)?;
                let level_str: String = row.get(3)?;
                Ok(ExecutionLogEntry {
                    task_id: task_id_str.parse().unwrap_or_default(),
                    sequence_number: row.get::<_, i64>(1)? as u64,
                    timestamp_utc: parse_datetime(row.get(2)?),
                    level: parse_log_level(&level_str),
                    message: row.get(4)?,
                    exception_details: row.get(5)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn record_skipped_occurrences(
        &self,
        task_id: TaskId,
        occurrences: Vec<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for occurrence in &occurrences {
                tx.execute(
                    "INSERT INTO skipped_occurrences (task_id, occurrence_utc) VALUES (?1,?2)",
                    params![task_id.to_string(), occurrence.to_rfc3339()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Information => "information",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

fn parse_log_level(s: &str) -> LogLevel {
    match s {
        "trace" => LogLevel::Trace,
        "debug" => LogLevel::Debug,
        "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        _ => LogLevel::Information,
    }
}
