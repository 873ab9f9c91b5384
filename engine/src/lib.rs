//! Persistent, in-process background task execution engine.
//!
//! [`TaskEngine`] is the composition root: register handlers with
//! [`TaskEngine::register_handler`], call [`TaskEngine::start`] to spawn the
//! scheduler and worker pools and run crash recovery, then submit work with
//! [`TaskEngine::dispatch`]. Everything below the engine — storage, queues,
//! the scheduler, cancellation — is reusable on its own if an embedder only
//! needs a piece of it.

pub mod blacklist;
pub mod cancellation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use blacklist::Blacklist;
pub use cancellation::{CancelReason, CancellationGuard, CancellationRegistry};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use engine::TaskEngine;
pub use error::{EngineError, StoreError};
pub use events::{EventPublisher, EventSink};
pub use queue::QueueManager;
pub use registry::{HandlerRegistry, TaskHandler};
pub use scheduler::Scheduler;
pub use store::{memory::MemoryStore, sqlite::SqliteStore, Page, TaskStore};

pub use shared::{
    AuditLevel, EngineConfig, EngineConfigBuilder, EventSeverity, ExecutionLogEntry,
    LinearRetryPolicy, LogLevel, PersistedTask, QueueConfig, QueueFullBehavior, RecurringSpec,
    RetryFilter, RetryPolicy, RunAudit, StatusAudit, TaskEvent, TaskId, TaskStatus,
};
