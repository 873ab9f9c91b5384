//! Storage contract: the `TaskStore` trait plus the two implementations that
//! ship in this crate.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shared::{ExecutionLogEntry, PersistedTask, TaskId, TaskStatus};

use crate::error::StoreError;

/// A cursor-paged slice of tasks, ordered `(CreatedAtUtc, Id)` ascending.
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<(DateTime<Utc>, TaskId)>,
}

/// Persists tasks and their audit trail. Implementations must be safe under
/// concurrent callers and must never reorder `StatusAudit` rows for a given
/// task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Errors with `DuplicateTaskKey` if `task_key` is set
    /// and a non-terminal task already carries it.
    async fn persist(&self, task: PersistedTask) -> Result<(), StoreError>;

    /// Update status, optionally recording an exception and/or execution
    /// duration, appending a `StatusAudit` row when `task.audit_level` allows.
    async fn set_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        exception: Option<String>,
    ) -> Result<(), StoreError>;

    async fn set_queued(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.set_status(task_id, TaskStatus::Queued, None).await
    }

    async fn set_in_progress(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.set_status(task_id, TaskStatus::InProgress, None).await
    }

    async fn set_completed(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.set_status(task_id, TaskStatus::Completed, None).await
    }

    async fn set_cancelled_by_user(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.set_status(task_id, TaskStatus::Cancelled, None).await
    }

    async fn set_cancelled_by_service(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.set_status(task_id, TaskStatus::ServiceStopped, None).await
    }

    /// Increment `current_run_count`, append a `RunAudit` row, and optionally
    /// update `next_run_utc`.
    async fn update_current_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        duration_ms: Option<u64>,
        next_run_utc: Option<DateTime<Utc>>,
        exception: Option<String>,
    ) -> Result<(), StoreError>;

    /// Cursor-paged read of recovery-eligible tasks, `(CreatedAtUtc, Id)` ascending.
    async fn retrieve_pending(
        &self,
        cursor: Option<(DateTime<Utc>, TaskId)>,
        take: usize,
    ) -> Result<Page<PersistedTask>, StoreError>;

    async fn get_by_task_key(&self, task_key: &str) -> Result<Option<PersistedTask>, StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<PersistedTask>, StoreError>;

    async fn get_all(&self) -> Result<Vec<PersistedTask>, StoreError>;

    async fn remove(&self, task_id: TaskId) -> Result<(), StoreError>;

    async fn save_execution_logs(&self, entries: Vec<ExecutionLogEntry>) -> Result<(), StoreError>;

    async fn get_execution_logs(&self, task_id: TaskId) -> Result<Vec<ExecutionLogEntry>, StoreError>;

    /// Record due times that were skipped while the service was down, without
    /// counting them against `max_runs`.
    async fn record_skipped_occurrences(
        &self,
        task_id: TaskId,
        occurrences: Vec<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}
