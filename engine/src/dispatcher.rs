//! The public entry point for submitting and cancelling work.
//!
//! `Dispatcher::dispatch` is the only way a new task enters the system: it
//! persists the row first (so a crash right after never loses the
//! submission), then routes it to the scheduler or straight to a queue
//! depending on whether it's due now.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use shared::{AuditLevel, EngineConfig, PersistedTask, RecurringSpec, TaskId, TaskStatus};

use crate::blacklist::Blacklist;
use crate::cancellation::{CancelReason, CancellationRegistry};
use crate::error::EngineError;
use crate::queue::QueueManager;
use crate::registry::{request_type_name, HandlerRegistry};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;

/// Per-dispatch overrides. Every field left `None` falls back to the engine
/// or queue default.
#[derive(Default)]
pub struct DispatchOptions {
    pub queue_name: Option<String>,
    pub task_key: Option<String>,
    pub scheduled_execution_utc: Option<DateTime<Utc>>,
    pub recurring: Option<RecurringSpec>,
    pub audit_level: Option<AuditLevel>,
    pub timeout: Option<Duration>,
}

pub struct Dispatcher {
    config: Arc<EngineConfig>,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    blacklist: Arc<Blacklist>,
    cancellations: Arc<CancellationRegistry>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        queues: Arc<QueueManager>,
        scheduler: Arc<Scheduler>,
        blacklist: Arc<Blacklist>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Dispatcher {
            config,
            store,
            registry,
            queues,
            scheduler,
            blacklist,
            cancellations,
        }
    }

    /// Submit `request` for execution by whatever handler is registered for
    /// its type. Returns the new task's id, which doubles as a cursor.
    pub async fn dispatch<Req>(&self, request: &Req, options: DispatchOptions) -> Result<TaskId, EngineError>
    where
        Req: Serialize + 'static,
    {
        let request_type = request_type_name::<Req>();
        if !self.registry.is_registered(request_type) {
            return Err(EngineError::HandlerNotRegistered(request_type.to_string()));
        }

        if let Some(key) = &options.task_key {
            if let Some(existing) = self.store.get_by_task_key(key).await? {
                if !existing.status.is_terminal() {
                    return Ok(existing.id);
                }
            }
        }

        let handler_type_name = self
            .registry
            .resolve(request_type)
            .map(|entry| entry.handler_type_name)
            .unwrap_or("unknown");

        let payload = serde_json::to_value(request)?;
        let is_recurring = options.recurring.is_some();
        let queue_name = options.queue_name.unwrap_or_else(|| {
            if is_recurring {
                shared::defaults::default_recurring_queue_name()
            } else {
                self.config.default_queue.clone()
            }
        });
        let audit_level = options.audit_level.unwrap_or(self.config.default_audit_level);

        let now = Utc::now();
        let first_due = match &options.recurring {
            Some(spec) => spec.calculate_next_run(now, 0),
            None => Some(options.scheduled_execution_utc.unwrap_or(now)),
        };
        let max_runs = options.recurring.as_ref().and_then(|spec| spec.max_runs);
        let run_until_utc = options.recurring.as_ref().and_then(|spec| spec.run_until_utc);

        let task_id = TaskId::new();
        let task = PersistedTask {
            id: task_id,
            task_key: options.task_key,
            request_payload: payload,
            request_type_name: request_type.to_string(),
            handler_type_name: handler_type_name.to_string(),
            queue_name: queue_name.clone(),
            status: TaskStatus::WaitingQueue,
            scheduled_execution_utc: options.scheduled_execution_utc,
            is_recurring,
            recurring_spec: options.recurring,
            max_runs,
            run_until_utc,
            current_run_count: 0,
            next_run_utc: first_due,
            audit_level,
            created_at_utc: now,
            last_execution_utc: None,
            exception: None,
        };

        self.store.persist(task).await?;

        match first_due {
            Some(due_at) if due_at > now => {
                self.scheduler.schedule(task_id, due_at, queue_name).await;
            }
            _ => {
                self.route_or_fallback(&queue_name, task_id).await?;
            }
        }

        Ok(task_id)
    }

    /// `QueueManager::enqueue` itself transitions the task to `Queued` on
    /// success, or to `Cancelled` if it was blacklisted. A `QueueFull` error
    /// (the `ThrowException` policy) must leave the task exactly where it
    /// was — `WaitingQueue` — so storage is never touched here.
    async fn route_or_fallback(&self, queue_name: &str, task_id: TaskId) -> Result<(), EngineError> {
        match self.queues.enqueue(self.store.as_ref(), &self.blacklist, queue_name, task_id).await {
            Ok(()) => Ok(()),
            Err(EngineError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Cancel a task. Pre-execution tasks transition straight to `Cancelled`;
    /// in-flight tasks are signalled via their cancellation token and the
    /// executor finishes the transition once the handler observes it.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), EngineError> {
        self.blacklist.insert(task_id);

        if self.cancellations.cancel(&task_id, CancelReason::User) {
            info!(task_id = %task_id, "signalled in-flight task for cancellation");
            return Ok(());
        }

        if let Some(task) = self.store.get(task_id).await? {
            if !task.status.is_terminal() {
                self.store.set_cancelled_by_user(task_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskHandler;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    struct GreetHandler;

    #[async_trait]
    impl TaskHandler<Greet> for GreetHandler {
        async fn handle(&self, _task_id: TaskId, _request: &Greet, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn build_dispatcher() -> (Dispatcher, Arc<dyn TaskStore>, Arc<QueueManager>) {
        let config = Arc::new(EngineConfig::builder().build().unwrap());
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);
        let registry = Arc::new(registry);
        let queues = Arc::new(QueueManager::new(&config));
        let scheduler = Arc::new(Scheduler::new(2));
        let blacklist = Arc::new(Blacklist::new());
        let cancellations = Arc::new(CancellationRegistry::new());

        let dispatcher = Dispatcher::new(
            config,
            store.clone(),
            registry,
            queues.clone(),
            scheduler,
            blacklist,
            cancellations,
        );
        (dispatcher, store, queues)
    }

    #[tokio::test]
    async fn dispatch_persists_and_enqueues_immediate_task() {
        let (dispatcher, store, queues) = build_dispatcher();
        let task_id = dispatcher
            .dispatch(&Greet { name: "Ada".into() }, DispatchOptions::default())
            .await
            .unwrap();

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);

        let default_queue = queues.default_queue();
        let mut receiver = default_queue.take_receiver().await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id, task_id);
    }

    #[tokio::test]
    async fn dispatch_rejects_unregistered_request_type() {
        let (dispatcher, _store, _queues) = build_dispatcher();

        #[derive(Serialize, Deserialize)]
        struct Unregistered;

        let result = dispatcher.dispatch(&Unregistered, DispatchOptions::default()).await;
        assert!(matches!(result, Err(EngineError::HandlerNotRegistered(_))));
    }

    #[tokio::test]
    async fn duplicate_task_key_returns_existing_task_id() {
        let (dispatcher, _store, _queues) = build_dispatcher();
        let options = DispatchOptions {
            task_key: Some("idem".into()),
            ..Default::default()
        };
        let first = dispatcher.dispatch(&Greet { name: "Ada".into() }, options).await.unwrap();

        let options = DispatchOptions {
            task_key: Some("idem".into()),
            ..Default::default()
        };
        let second = dispatcher.dispatch(&Greet { name: "Ada".into() }, options).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cancel_before_execution_transitions_to_cancelled() {
        let (dispatcher, store, _queues) = build_dispatcher();
        let far_future = Utc::now() + chrono::Duration::hours(1);
        let options = DispatchOptions {
            scheduled_execution_utc: Some(far_future),
            ..Default::default()
        };
        let task_id = dispatcher.dispatch(&Greet { name: "Ada".into() }, options).await.unwrap();

        dispatcher.cancel(task_id).await.unwrap();
        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }
}
