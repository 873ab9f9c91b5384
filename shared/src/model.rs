//! The persisted task model and its audit trail.
//!
//! `PersistedTask` is the single source of truth for a submission. Everything
//! else in the engine — queue descriptors, scheduler heap entries, cancellation
//! registry keys — is a weak reference by [`TaskId`]: losing the in-memory
//! handle never loses the task, because storage owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guid::TaskId;
use crate::recurring::RecurringSpec;

/// Lifecycle status of a persisted task.
///
/// `Pending` is an alias for `WaitingQueue` used only while a row is being
/// walked by the recovery loop; storage never needs to distinguish the two
/// when deciding recovery eligibility (see [`TaskStatus::is_recovery_eligible`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    WaitingQueue,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    ServiceStopped,
    Pending,
}

impl TaskStatus {
    /// Whether a task in this status is recovery-eligible on service start.
    pub fn is_recovery_eligible(&self) -> bool {
        matches!(
            self,
            TaskStatus::WaitingQueue
                | TaskStatus::Queued
                | TaskStatus::InProgress
                | TaskStatus::ServiceStopped
                | TaskStatus::Pending
        )
    }

    /// Whether this status is terminal — a task here never transitions again
    /// (recurring tasks leave their terminal state only by being rescheduled
    /// into a fresh `WaitingQueue` row of the same task).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::WaitingQueue => "waiting_queue",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::ServiceStopped => "service_stopped",
            TaskStatus::Pending => "pending",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_queue" => Ok(TaskStatus::WaitingQueue),
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "service_stopped" => Ok(TaskStatus::ServiceStopped),
            "pending" => Ok(TaskStatus::Pending),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Controls which audit rows get written for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    None,
    #[default]
    Full,
    Minimal,
    ErrorsOnly,
}

impl AuditLevel {
    /// Whether a StatusAudit row should be written for a (non-error)
    /// transition at this audit level.
    pub fn records_status(&self, is_error: bool) -> bool {
        match self {
            AuditLevel::None => false,
            AuditLevel::Full => true,
            AuditLevel::Minimal => is_error,
            AuditLevel::ErrorsOnly => is_error,
        }
    }

    /// Whether a RunAudit row should be written for an execution attempt.
    pub fn records_run(&self, is_error: bool) -> bool {
        match self {
            AuditLevel::None => false,
            AuditLevel::Full => true,
            AuditLevel::Minimal => true,
            AuditLevel::ErrorsOnly => is_error,
        }
    }
}

/// One persisted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: TaskId,
    pub task_key: Option<String>,
    pub request_payload: Value,
    pub request_type_name: String,
    pub handler_type_name: String,
    pub queue_name: String,
    pub status: TaskStatus,
    pub scheduled_execution_utc: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurring_spec: Option<RecurringSpec>,
    pub max_runs: Option<u32>,
    pub run_until_utc: Option<DateTime<Utc>>,
    pub current_run_count: u32,
    pub next_run_utc: Option<DateTime<Utc>>,
    pub audit_level: AuditLevel,
    pub created_at_utc: DateTime<Utc>,
    pub last_execution_utc: Option<DateTime<Utc>>,
    pub exception: Option<String>,
}

impl PersistedTask {
    /// Whether this task has exhausted its recurring bounds as of `now`.
    pub fn bounds_exhausted(&self, now: DateTime<Utc>) -> bool {
        if let Some(max_runs) = self.max_runs {
            if self.current_run_count >= max_runs {
                return true;
            }
        }
        if let Some(run_until) = self.run_until_utc {
            if now >= run_until {
                return true;
            }
        }
        false
    }
}

/// Append-only row recording a status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAudit {
    pub task_id: TaskId,
    pub new_status: TaskStatus,
    pub updated_at_utc: DateTime<Utc>,
    pub exception: Option<String>,
}

/// Append-only row recording one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAudit {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub executed_at_utc: DateTime<Utc>,
    pub exception: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Severity of an [`ExecutionLogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
}

/// One log line attached to a task. `sequence_number` is strictly increasing
/// per task, starting at 0 — callers never choose it themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub task_id: TaskId,
    pub timestamp_utc: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub exception_details: Option<String>,
    pub sequence_number: u64,
}
