//! The outbound event shape emitted on every status transition and retry.
//!
//! This is the contract boundary with the external monitoring dashboard: the
//! dashboard itself, and the real-time bus that fans events out to it, are
//! out of scope here. This crate only defines what one event record looks
//! like; `engine::events` owns the fire-and-forget broadcast mechanism.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guid::TaskId;

/// Severity of a [`TaskEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Information,
    Warning,
    Error,
}

/// One emitted event. Emission is always fire-and-forget: a failure to
/// deliver this to a subscriber must never affect task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub event_date_utc: DateTime<Utc>,
    pub severity: EventSeverity,
    pub task_type: String,
    pub task_handler_type: String,
    pub task_parameters: Value,
    pub message: String,
    pub exception: Option<String>,
}

impl TaskEvent {
    pub fn new(
        task_id: TaskId,
        severity: EventSeverity,
        task_type: impl Into<String>,
        task_handler_type: impl Into<String>,
        task_parameters: Value,
        message: impl Into<String>,
    ) -> Self {
        TaskEvent {
            task_id,
            event_date_utc: Utc::now(),
            severity,
            task_type: task_type.into(),
            task_handler_type: task_handler_type.into(),
            task_parameters,
            message: message.into(),
            exception: None,
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}
