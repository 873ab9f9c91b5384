//! Crash-recovery pass: walk every recovery-eligible task left behind by a
//! prior process and re-route it, without ever replaying a recurring
//! occurrence that was missed while the service was down.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use shared::TaskStatus;

use crate::blacklist::Blacklist;
use crate::error::EngineError;
use crate::queue::QueueManager;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;

/// Page through `store.retrieve_pending` and re-dispatch every row: due-now
/// tasks go straight to their queue, future-dated tasks go back on the
/// scheduler. A task whose recurring bounds are already exhausted is marked
/// failed rather than silently dropped.
pub async fn run(
    store: &dyn TaskStore,
    queues: &QueueManager,
    scheduler: &Scheduler,
    blacklist: &Blacklist,
    page_size: usize,
) -> anyhow::Result<usize> {
    let mut cursor = None;
    let mut recovered = 0usize;

    loop {
        let page = store.retrieve_pending(cursor, page_size).await?;
        if page.items.is_empty() {
            break;
        }

        for task in &page.items {
            let now = Utc::now();
            if task.is_recurring && task.bounds_exhausted(now) {
                store
                    .set_status(task.id, TaskStatus::Failed, Some("recurring bounds exhausted during recovery".into()))
                    .await?;
                continue;
            }

            match task.scheduled_execution_utc.or(task.next_run_utc) {
                Some(due_at) if due_at > now => {
                    scheduler.schedule(task.id, due_at, task.queue_name.clone()).await;
                }
                _ => match queues.enqueue(store, blacklist, &task.queue_name, task.id).await {
                    Ok(()) | Err(EngineError::Cancelled) => {}
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "failed to re-enqueue recovered task");
                        continue;
                    }
                },
            }
            recovered += 1;
        }

        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    info!(recovered, "recovery pass complete");
    Ok(recovered)
}

/// Convenience wrapper for callers holding an `Arc<dyn TaskStore>`.
pub async fn run_arc(
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    blacklist: Arc<Blacklist>,
    page_size: usize,
) -> anyhow::Result<usize> {
    run(store.as_ref(), queues.as_ref(), scheduler.as_ref(), blacklist.as_ref(), page_size).await
}
