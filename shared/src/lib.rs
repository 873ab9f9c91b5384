//! Shared data model, configuration, and scheduling primitives for the task engine.
//!
//! This crate contains the types that are meaningful without any async runtime:
//! the persisted task model, the recurring-schedule calculator, the retry-policy
//! contract, the event shape emitted on status transitions, and the engine
//! configuration builder. The `engine` crate wires these into a running system.

pub mod config;
pub mod defaults;
pub mod events;
pub mod guid;
pub mod model;
pub mod recurring;
pub mod retry;

pub use config::{EngineConfig, EngineConfigBuilder, QueueConfig, QueueFullBehavior};
pub use events::{EventSeverity, TaskEvent};
pub use guid::TaskId;
pub use model::{
    AuditLevel, ExecutionLogEntry, LogLevel, PersistedTask, RunAudit, StatusAudit, TaskStatus,
};
pub use recurring::RecurringSpec;
pub use retry::{LinearRetryPolicy, RetryFilter, RetryPolicy};

/// Result type alias used throughout the shared crate.
pub type Result<T> = anyhow::Result<T>;

/// Errors raised while building configuration or policy objects.
///
/// These are caught at construction time, before any task is ever dispatched,
/// matching the engine's "fail fast at configuration time" contract.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("retry policy cannot mix a whitelist (Handle<T>) and a blacklist (DoNotHandle<T>)")]
    MixedRetryFilter,

    #[error("retry policy must allow at least one attempt")]
    ZeroRetryAttempts,

    #[error("queue name cannot be empty")]
    EmptyQueueName,

    #[error("duplicate queue name: {0}")]
    DuplicateQueueName(String),

    #[error("channel capacity must be greater than zero (queue {0:?})")]
    InvalidChannelCapacity(Option<String>),

    #[error("scheduler shard count must be at least 1")]
    InvalidShardCount,

    #[error("max degree of parallelism must be at least 1 (queue {0:?})")]
    InvalidParallelism(Option<String>),
}
