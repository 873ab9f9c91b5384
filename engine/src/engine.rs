//! Composition root: wires storage, registry, queues, scheduler, and
//! executor workers into one running system.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shared::{EngineConfig, TaskId};

use crate::blacklist::Blacklist;
use crate::cancellation::CancellationRegistry;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::EngineError;
use crate::events::EventPublisher;
use crate::executor::{self, ExecutorContext};
use crate::queue::QueueManager;
use crate::recovery;
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;

/// A running (or not-yet-started) task engine.
///
/// Handlers are registered directly on the engine; the registry is only
/// wrapped behind an `Arc` once `start()` runs, so registration never has to
/// fight a reference already handed out to a worker.
pub struct TaskEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    blacklist: Arc<Blacklist>,
    cancellations: Arc<CancellationRegistry>,
    events: Arc<EventPublisher>,
    shutdown: CancellationToken,
    dispatcher: Option<Dispatcher>,
}

impl TaskEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn TaskStore>) -> Self {
        let config = Arc::new(config);
        let queues = Arc::new(QueueManager::new(&config));
        let scheduler = Arc::new(Scheduler::new(config.shard_count));

        TaskEngine {
            config,
            store,
            registry: HandlerRegistry::new(),
            queues,
            scheduler,
            blacklist: Arc::new(Blacklist::new()),
            cancellations: Arc::new(CancellationRegistry::new()),
            events: Arc::new(EventPublisher::new()),
            shutdown: CancellationToken::new(),
            dispatcher: None,
        }
    }

    /// Must be called before `start()` — the registry is frozen into an
    /// `Arc` at startup and shared with every worker from then on.
    pub fn register_handler<Req, H>(&mut self, handler: H)
    where
        Req: serde::de::DeserializeOwned + Serialize + Send + Sync + 'static,
        H: crate::registry::TaskHandler<Req>,
    {
        self.registry.register::<Req, H>(handler);
    }

    pub fn events(&self) -> Arc<EventPublisher> {
        self.events.clone()
    }

    pub async fn dispatch<Req>(&self, request: &Req, options: DispatchOptions) -> Result<TaskId, EngineError>
    where
        Req: Serialize + 'static,
    {
        self.dispatcher
            .as_ref()
            .expect("start() must be called before dispatch()")
            .dispatch(request, options)
            .await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<(), EngineError> {
        self.dispatcher
            .as_ref()
            .expect("start() must be called before cancel()")
            .cancel(task_id)
            .await
    }

    /// Freeze the handler registry, spawn the scheduler's shard loops and
    /// every queue's worker pool, then run one recovery pass so tasks left
    /// behind by a prior process resume. Idempotent: a second call is a
    /// no-op.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.dispatcher.is_some() {
            return Ok(());
        }

        let registry = Arc::new(std::mem::take(&mut self.registry));
        self.dispatcher = Some(Dispatcher::new(
            self.config.clone(),
            self.store.clone(),
            registry.clone(),
            self.queues.clone(),
            self.scheduler.clone(),
            self.blacklist.clone(),
            self.cancellations.clone(),
        ));

        self.scheduler.spawn_loops(
            self.queues.clone(),
            self.store.clone(),
            self.blacklist.clone(),
            self.shutdown.clone(),
        );

        for name in self.queues.queue_names().map(str::to_string).collect::<Vec<_>>() {
            let queue = self.queues.get(&name).expect("queue just listed by name");
            let ctx = ExecutorContext {
                config: self.config.clone(),
                store: self.store.clone(),
                registry: registry.clone(),
                blacklist: self.blacklist.clone(),
                cancellations: self.cancellations.clone(),
                events: self.events.clone(),
                scheduler: self.scheduler.clone(),
                shutdown: self.shutdown.clone(),
            };
            executor::spawn_workers(queue, ctx).await;
        }

        let recovered = recovery::run(
            self.store.as_ref(),
            self.queues.as_ref(),
            self.scheduler.as_ref(),
            self.blacklist.as_ref(),
            self.config.recovery_page_size,
        )
        .await?;
        info!(recovered, "engine started");
        Ok(())
    }

    /// Signal shutdown and wait up to the configured grace period for
    /// in-flight tasks to observe cancellation and finish their transition.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::time::sleep(self.grace_period()).await;
    }

    fn grace_period(&self) -> Duration {
        self.config.shutdown_grace_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskHandler;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tokio_util::sync::CancellationToken as Token;

    #[derive(Serialize, Deserialize)]
    struct Ping;

    struct PingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<Ping> for PingHandler {
        async fn handle(&self, _task_id: TaskId, _request: &Ping, _cancel: Token) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatched_task_runs_to_completion() {
        let config = EngineConfig::builder().build().unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let mut engine = TaskEngine::new(config, store.clone());
        let count = Arc::new(AtomicUsize::new(0));
        engine.register_handler::<Ping, _>(PingHandler { count: count.clone() });

        engine.start().await.unwrap();
        let task_id = engine.dispatch(&Ping, DispatchOptions::default()).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, shared::TaskStatus::Completed);
    }

    struct StallForever;

    #[async_trait]
    impl TaskHandler<Ping> for StallForever {
        async fn handle(&self, _task_id: TaskId, _request: &Ping, cancel: Token) -> anyhow::Result<()> {
            cancel.cancelled().await;
            anyhow::bail!("should have been cancelled before returning");
        }
    }

    #[tokio::test]
    async fn timed_out_handler_is_cancelled_via_cooperative_signal() {
        let config = EngineConfig::builder()
            .set_default_timeout(StdDuration::from_millis(50))
            .build()
            .unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let mut engine = TaskEngine::new(config, store.clone());
        engine.register_handler::<Ping, _>(StallForever);

        engine.start().await.unwrap();
        let task_id = engine.dispatch(&Ping, DispatchOptions::default()).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, shared::TaskStatus::Cancelled);
    }

    struct SingleAttemptRetryPolicy;

    impl shared::RetryPolicy for SingleAttemptRetryPolicy {
        fn max_attempts(&self) -> u32 {
            1
        }

        fn delay_for(&self, _attempt: u32) -> StdDuration {
            StdDuration::ZERO
        }

        fn should_retry(&self, _error: &anyhow::Error) -> bool {
            true
        }
    }

    struct AlwaysFailsOnce {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<Ping> for AlwaysFailsOnce {
        async fn handle(&self, _task_id: TaskId, _request: &Ping, _cancel: Token) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        }

        fn retry_policy(&self) -> Option<Arc<dyn shared::RetryPolicy>> {
            Some(Arc::new(SingleAttemptRetryPolicy))
        }
    }

    #[tokio::test]
    async fn handler_retry_policy_override_wins_over_engine_default() {
        use shared::LinearRetryPolicy;

        let config = EngineConfig::builder()
            .set_default_retry_policy(Arc::new(LinearRetryPolicy::fixed(5, StdDuration::from_millis(1)).unwrap()))
            .build()
            .unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let mut engine = TaskEngine::new(config, store.clone());
        let attempts = Arc::new(AtomicUsize::new(0));
        engine.register_handler::<Ping, _>(AlwaysFailsOnce { attempts: attempts.clone() });

        engine.start().await.unwrap();
        let task_id = engine.dispatch(&Ping, DispatchOptions::default()).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(200)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1, "handler's own retry policy allows only one attempt");
        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, shared::TaskStatus::Failed);
    }
}
