//! Crate-wide error taxonomy.
//!
//! `EngineError` sits at the boundary the way `shared::ConfigError` sits at
//! the configuration boundary: every public operation converges on it, and
//! internal module errors (`StoreError`) convert in with `#[from]` so callers
//! only ever match on one enum.

use shared::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task key {0:?} already has a non-terminal task")]
    DuplicateTaskKey(String),

    #[error("storage backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no handler registered for request type {0:?}")]
    HandlerNotRegistered(String),

    #[error("failed to serialize or deserialize task payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage operation failed: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("queue {0:?} is full")]
    QueueFull(String),

    #[error("handler failed: {0}")]
    HandlerFailure(#[source] anyhow::Error),

    #[error("task timed out")]
    Timeout,

    #[error("task was cancelled by the caller")]
    UserCancellation,

    #[error("task was blacklisted before it could be enqueued")]
    Cancelled,

    #[error("task was cancelled by service shutdown")]
    ServiceShutdownCancellation,

    #[error("invalid engine configuration: {0}")]
    ConfigurationError(#[from] shared::ConfigError),
}

impl EngineError {
    /// Whether this error already represents a terminal cancellation state
    /// that must never be routed through the retry policy.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout
                | EngineError::UserCancellation
                | EngineError::ServiceShutdownCancellation
        )
    }
}
