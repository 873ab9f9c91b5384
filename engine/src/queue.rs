//! Worker queues: bounded channels that hand dispatched tasks off to the
//! per-queue executor loop.
//!
//! One `WorkerQueue` per configured queue name, each with its own bounded
//! `mpsc` channel and degree of parallelism. A full queue is handled
//! according to its `QueueFullBehavior`: `Wait` backs the caller off until
//! capacity frees, `ThrowException` fails the dispatch immediately, and
//! `FallbackToDefault` re-routes onto the default queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use shared::{EngineConfig, QueueFullBehavior, TaskId};

use crate::blacklist::Blacklist;
use crate::error::EngineError;
use crate::store::TaskStore;

/// A task handed to a worker queue: just enough to run the executor's
/// lifecycle without re-reading storage before the worker picks it up.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
}

/// One named queue: a sender/receiver pair plus the configured fallback
/// behavior for when the channel is full.
pub struct WorkerQueue {
    name: String,
    sender: mpsc::Sender<QueuedTask>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<QueuedTask>>>,
    full_behavior: QueueFullBehavior,
    max_degree_of_parallelism: usize,
}

impl WorkerQueue {
    fn new(name: String, capacity: usize, full_behavior: QueueFullBehavior, max_degree_of_parallelism: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        WorkerQueue {
            name,
            sender,
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            full_behavior,
            max_degree_of_parallelism,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    /// Hand the receiving half to the executor loop. Only the first caller
    /// gets it — the loop is spawned exactly once per queue at startup.
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<QueuedTask>> {
        self.receiver.lock().await.take()
    }

    fn try_send(&self, task: QueuedTask) -> Result<(), mpsc::error::TrySendError<QueuedTask>> {
        self.sender.try_send(task)
    }

    async fn send_waiting(&self, task: QueuedTask) -> Result<(), EngineError> {
        self.sender
            .send(task)
            .await
            .map_err(|_| EngineError::QueueFull(self.name.clone()))
    }
}

/// Owns every configured `WorkerQueue` and applies `QueueFullBehavior` on
/// dispatch.
pub struct QueueManager {
    queues: HashMap<String, Arc<WorkerQueue>>,
    default_queue: String,
}

impl QueueManager {
    pub fn new(config: &EngineConfig) -> Self {
        let queues = config
            .queues
            .values()
            .map(|queue_config| {
                let queue = Arc::new(WorkerQueue::new(
                    queue_config.name.clone(),
                    queue_config.channel_capacity,
                    queue_config.queue_full_behavior,
                    queue_config.max_degree_of_parallelism,
                ));
                (queue_config.name.clone(), queue)
            })
            .collect();

        QueueManager {
            queues,
            default_queue: config.default_queue.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerQueue>> {
        self.queues.get(name).cloned()
    }

    pub fn default_queue(&self) -> Arc<WorkerQueue> {
        self.queues[&self.default_queue].clone()
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Enqueue `task_id` onto `queue_name` (or the default queue if
    /// unconfigured), applying that queue's `QueueFullBehavior` when full.
    ///
    /// A blacklisted task is refused outright and transitioned to
    /// `Cancelled` without ever touching the channel. Only a *successful*
    /// send transitions the task to `Queued` — a full queue under
    /// `ThrowException` must leave the task exactly where it was.
    pub async fn enqueue(
        &self,
        store: &dyn TaskStore,
        blacklist: &Blacklist,
        queue_name: &str,
        task_id: TaskId,
    ) -> Result<(), EngineError> {
        if blacklist.contains(&task_id) {
            blacklist.remove(&task_id);
            store.set_cancelled_by_user(task_id).await?;
            return Err(EngineError::Cancelled);
        }

        let queue = self.queues.get(queue_name).cloned().unwrap_or_else(|| self.default_queue());
        let task = QueuedTask { task_id };

        let result = match queue.try_send(task.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::QueueFull(queue.name.clone())),
            Err(mpsc::error::TrySendError::Full(task)) => match queue.full_behavior {
                QueueFullBehavior::Wait => queue.send_waiting(task).await,
                QueueFullBehavior::ThrowException => Err(EngineError::QueueFull(queue.name.clone())),
                QueueFullBehavior::FallbackToDefault => {
                    warn!(queue = %queue.name, task_id = %task_id, "queue full, falling back to default queue");
                    let default = self.default_queue();
                    default
                        .sender
                        .send(task)
                        .await
                        .map_err(|_| EngineError::QueueFull(default.name.clone()))
                }
            },
        };

        if result.is_ok() {
            store.set_queued(task_id).await?;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use shared::{AuditLevel, EngineConfig, PersistedTask, TaskStatus};

    fn sample_task(id: TaskId) -> PersistedTask {
        PersistedTask {
            id,
            task_key: None,
            request_payload: serde_json::json!({}),
            request_type_name: "Req".into(),
            handler_type_name: "Handler".into(),
            queue_name: "default".into(),
            status: TaskStatus::WaitingQueue,
            scheduled_execution_utc: None,
            is_recurring: false,
            recurring_spec: None,
            max_runs: None,
            run_until_utc: None,
            current_run_count: 0,
            next_run_utc: None,
            audit_level: AuditLevel::Full,
            created_at_utc: Utc::now(),
            last_execution_utc: None,
            exception: None,
        }
    }

    #[tokio::test]
    async fn enqueue_delivers_to_named_queue() {
        let config = EngineConfig::builder().build().unwrap();
        let manager = QueueManager::new(&config);
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new();
        let task_id = TaskId::new();
        store.persist(sample_task(task_id)).await.unwrap();
        manager.enqueue(store.as_ref(), &blacklist, "default", task_id).await.unwrap();

        let default_queue = manager.default_queue();
        let mut receiver = default_queue.take_receiver().await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id, task_id);

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn unknown_queue_name_falls_back_to_default() {
        let config = EngineConfig::builder().build().unwrap();
        let manager = QueueManager::new(&config);
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new();
        let task_id = TaskId::new();
        store.persist(sample_task(task_id)).await.unwrap();
        manager.enqueue(store.as_ref(), &blacklist, "does-not-exist", task_id).await.unwrap();

        let default_queue = manager.default_queue();
        let mut receiver = default_queue.take_receiver().await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id, task_id);
    }

    #[tokio::test]
    async fn full_queue_with_throw_exception_behavior_errors() {
        use shared::QueueConfig;
        let config = EngineConfig::builder()
            .add_queue(
                QueueConfig::new("tiny")
                    .with_channel_capacity(1)
                    .with_queue_full_behavior(QueueFullBehavior::ThrowException),
            )
            .build()
            .unwrap();
        let manager = QueueManager::new(&config);
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new();

        let first = TaskId::new();
        let second = TaskId::new();
        store.persist(sample_task(first)).await.unwrap();
        store.persist(sample_task(second)).await.unwrap();

        manager.enqueue(store.as_ref(), &blacklist, "tiny", first).await.unwrap();
        let result = manager.enqueue(store.as_ref(), &blacklist, "tiny", second).await;
        assert!(matches!(result, Err(EngineError::QueueFull(_))));

        let stored = store.get(second).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::WaitingQueue, "a rejected enqueue must not advance the task's status");
    }

    #[tokio::test]
    async fn full_queue_with_fallback_behavior_routes_to_default() {
        use shared::QueueConfig;
        let config = EngineConfig::builder()
            .add_queue(
                QueueConfig::new("tiny")
                    .with_channel_capacity(1)
                    .with_queue_full_behavior(QueueFullBehavior::FallbackToDefault),
            )
            .build()
            .unwrap();
        let manager = QueueManager::new(&config);
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new();

        let first = TaskId::new();
        let fallback_id = TaskId::new();
        store.persist(sample_task(first)).await.unwrap();
        store.persist(sample_task(fallback_id)).await.unwrap();

        manager.enqueue(store.as_ref(), &blacklist, "tiny", first).await.unwrap();
        manager.enqueue(store.as_ref(), &blacklist, "tiny", fallback_id).await.unwrap();

        let default_queue = manager.default_queue();
        let mut receiver = default_queue.take_receiver().await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id, fallback_id);
    }

    #[tokio::test]
    async fn blacklisted_task_is_refused_and_cancelled() {
        let config = EngineConfig::builder().build().unwrap();
        let manager = QueueManager::new(&config);
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new();
        let task_id = TaskId::new();
        store.persist(sample_task(task_id)).await.unwrap();
        blacklist.insert(task_id);

        let result = manager.enqueue(store.as_ref(), &blacklist, "default", task_id).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(!blacklist.contains(&task_id));

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }
}
