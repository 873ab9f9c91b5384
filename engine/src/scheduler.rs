//! Sharded due-time scheduler.
//!
//! Future-dated and recurring tasks sit in one of `S` shards, each an
//! independent `BinaryHeap` guarded by its own lock and woken by its own
//! `Notify`. Sharding by [`TaskId::shard_index`] means a burst of inserts
//! into one shard never blocks a read of another, and a panic or stall in
//! one shard's loop never stops the others — failure isolation is a property
//! of the design, not something bolted on with `catch_unwind`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use shared::TaskId;

use crate::blacklist::Blacklist;
use crate::error::EngineError;
use crate::queue::QueueManager;
use crate::store::TaskStore;

#[derive(Clone)]
struct ScheduledEntry {
    due_at: DateTime<Utc>,
    task_id: TaskId,
    queue_name: String,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.task_id == other.task_id
    }
}
impl Eq for ScheduledEntry {}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest due time first.
        other.due_at.cmp(&self.due_at).then_with(|| other.task_id.cmp(&self.task_id))
    }
}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shard {
    heap: Mutex<BinaryHeap<ScheduledEntry>>,
    notify: Notify,
}

impl Default for Shard {
    fn default() -> Self {
        Shard {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }
}

/// Sharded min-heap of due times, each shard driven by its own spawned loop.
pub struct Scheduler {
    shards: Vec<Arc<Shard>>,
}

impl Scheduler {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Scheduler {
            shards: (0..shard_count).map(|_| Arc::new(Shard::default())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Schedule `task_id` to become due at `due_at` on `queue_name`. Wakes
    /// the owning shard's loop in case this is now its earliest entry.
    pub async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>, queue_name: String) {
        let shard = &self.shards[task_id.shard_index(self.shards.len())];
        shard.heap.lock().await.push(ScheduledEntry { due_at, task_id, queue_name });
        shard.notify.notify_one();
    }

    /// Spawn one loop per shard. Each loop runs until `shutdown` fires.
    pub fn spawn_loops(
        self: &Arc<Self>,
        queues: Arc<QueueManager>,
        store: Arc<dyn TaskStore>,
        blacklist: Arc<Blacklist>,
        shutdown: CancellationToken,
    ) {
        for index in 0..self.shards.len() {
            let scheduler = self.clone();
            let queues = queues.clone();
            let store = store.clone();
            let blacklist = blacklist.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler.run_shard(index, queues, store, blacklist, shutdown).await;
            });
        }
    }

    async fn run_shard(
        &self,
        index: usize,
        queues: Arc<QueueManager>,
        store: Arc<dyn TaskStore>,
        blacklist: Arc<Blacklist>,
        shutdown: CancellationToken,
    ) {
        let shard = self.shards[index].clone();
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let sleep_for = {
                let heap = shard.heap.lock().await;
                match heap.peek() {
                    Some(entry) => {
                        let now = Utc::now();
                        if entry.due_at <= now {
                            StdDuration::ZERO
                        } else {
                            (entry.due_at - now)
                                .to_std()
                                .unwrap_or(StdDuration::ZERO)
                                .min(shared::defaults::max_scheduler_sleep())
                        }
                    }
                    None => shared::defaults::max_scheduler_sleep(),
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shard.notify.notified() => continue,
            }

            self.drain_due(index, &queues, store.as_ref(), blacklist.as_ref()).await;
        }
    }

    async fn drain_due(&self, index: usize, queues: &QueueManager, store: &dyn TaskStore, blacklist: &Blacklist) {
        let shard = &self.shards[index];
        loop {
            let due = {
                let mut heap = shard.heap.lock().await;
                match heap.peek() {
                    Some(entry) if entry.due_at <= Utc::now() => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };

            // A failure dispatching one entry must never stop the shard from
            // processing the rest of its due tasks.
            if let Err(err) = self.dispatch_due(entry, queues, store, blacklist).await {
                error!(shard = index, error = %err, "failed to dispatch due task");
            }
        }
    }

    async fn dispatch_due(
        &self,
        entry: ScheduledEntry,
        queues: &QueueManager,
        store: &dyn TaskStore,
        blacklist: &Blacklist,
    ) -> anyhow::Result<()> {
        let task = match store.get(entry.task_id).await? {
            Some(task) => task,
            None => {
                warn!(task_id = %entry.task_id, "scheduled task vanished from storage before becoming due");
                return Ok(());
            }
        };

        if task.status.is_terminal() {
            return Ok(());
        }

        // `queues.enqueue` performs the `Queued` transition itself on
        // success, so a failure here leaves the task exactly as it was
        // rather than stranding it mid-transition.
        match queues.enqueue(store, blacklist, &entry.queue_name, entry.task_id).await {
            Ok(()) | Err(EngineError::Cancelled) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
