//! Per-queue worker executor: the loop that actually turns a queued task id
//! into a handler invocation, with retries, timeout, and cancellation.
//!
//! Each queue's `max_degree_of_parallelism` workers share one receiver
//! behind a `tokio::sync::Mutex`; whichever worker is free when a task
//! arrives locks the receiver, takes the one item, and releases it before
//! starting work, so the others aren't blocked while a handler runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shared::{EngineConfig, EventSeverity, TaskEvent, TaskId, TaskStatus};

use crate::cancellation::{CancelReason, CancellationGuard, CancellationRegistry};
use crate::error::EngineError;
use crate::events::EventPublisher;
use crate::queue::{QueuedTask, WorkerQueue};
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;

/// Everything a worker needs to run a task to completion. Cheap to clone —
/// every field is an `Arc`.
#[derive(Clone)]
pub struct ExecutorContext {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<HandlerRegistry>,
    pub blacklist: Arc<crate::blacklist::Blacklist>,
    pub cancellations: Arc<CancellationRegistry>,
    pub events: Arc<EventPublisher>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
}

/// Spawn `queue.max_degree_of_parallelism()` workers draining `queue`. A
/// no-op if the queue's receiver was already taken by an earlier call.
pub async fn spawn_workers(queue: Arc<WorkerQueue>, ctx: ExecutorContext) {
    let Some(receiver) = queue.take_receiver().await else {
        return;
    };
    let receiver = Arc::new(Mutex::new(receiver));

    for worker_index in 0..queue.max_degree_of_parallelism() {
        let receiver = receiver.clone();
        let ctx = ctx.clone();
        let queue_name = queue.name().to_string();
        tokio::spawn(async move {
            worker_loop(worker_index, &queue_name, receiver, ctx).await;
        });
    }
}

async fn worker_loop(
    worker_index: usize,
    queue_name: &str,
    receiver: Arc<Mutex<tokio::sync::mpsc::Receiver<QueuedTask>>>,
    ctx: ExecutorContext,
) {
    loop {
        let queued = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                _ = ctx.shutdown.cancelled() => None,
                item = guard.recv() => item,
            }
        };

        let Some(queued) = queued else {
            info!(queue = queue_name, worker = worker_index, "worker exiting, queue closed or shutdown");
            return;
        };

        if let Err(err) = run_task(queued.task_id, &ctx).await {
            error!(task_id = %queued.task_id, error = %err, "task execution failed unrecoverably");
        }
    }
}

/// Run the full lifecycle for one task: blacklist check, status transitions,
/// handler resolution, retry loop, and terminal disposition.
async fn run_task(task_id: TaskId, ctx: &ExecutorContext) -> Result<(), EngineError> {
    let task = match ctx.store.get(task_id).await? {
        Some(task) => task,
        None => return Ok(()),
    };
    if task.status.is_terminal() {
        return Ok(());
    }

    if ctx.blacklist.contains(&task_id) {
        ctx.store.set_cancelled_by_user(task_id).await?;
        ctx.blacklist.remove(&task_id);
        ctx.events
            .publish(TaskEvent::new(
                task_id,
                EventSeverity::Warning,
                &task.request_type_name,
                &task.handler_type_name,
                task.request_payload.clone(),
                "cancelled before execution",
            ))
            .await;
        return Ok(());
    }

    ctx.store.set_in_progress(task_id).await?;
    ctx.events
        .publish(TaskEvent::new(
            task_id,
            EventSeverity::Information,
            &task.request_type_name,
            &task.handler_type_name,
            task.request_payload.clone(),
            "started",
        ))
        .await;

    let handler = match ctx.registry.resolve(&task.request_type_name) {
        Some(handler) => handler,
        None => {
            let err = EngineError::HandlerNotRegistered(task.request_type_name.clone());
            ctx.store.set_status(task_id, TaskStatus::Failed, Some(err.to_string())).await?;
            return Err(err);
        }
    };

    let (guard, cancel_token) = CancellationGuard::new(&ctx.cancellations, task_id, &ctx.shutdown);
    handler.on_started(task_id).await;

    let timeout = ctx
        .config
        .queue_or_default(Some(&task.queue_name))
        .default_timeout
        .or(ctx.config.default_timeout);

    let retry_policy = handler.retry_policy().unwrap_or_else(|| ctx.config.default_retry_policy.clone());
    let max_attempts = retry_policy.max_attempts();

    let mut attempt: u32 = 1;
    let outcome = loop {
        let started = Instant::now();
        let attempt_result = run_attempt(
            handler,
            task_id,
            &task.request_payload,
            cancel_token.clone(),
            timeout,
            &ctx.cancellations,
        )
        .await;
        let elapsed = started.elapsed();

        match attempt_result {
            Ok(()) => break Ok(elapsed),
            Err(AttemptError::Cancelled(reason)) => break Err(AttemptOutcome::Cancelled(reason)),
            Err(AttemptError::Handler(err)) => {
                let should_retry = attempt < max_attempts && retry_policy.should_retry(&err);
                if !should_retry {
                    break Err(AttemptOutcome::HandlerFailure(err));
                }
                let delay = retry_policy.delay_for(attempt);
                handler.on_retry(task_id, attempt, &err, delay).await;
                ctx.events
                    .publish(TaskEvent::new(
                        task_id,
                        EventSeverity::Warning,
                        &task.request_type_name,
                        &task.handler_type_name,
                        task.request_payload.clone(),
                        format!("retrying after attempt {attempt} failed: {err}"),
                    ))
                    .await;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    };

    drop(guard);
    handler.dispose(task_id).await;

    match outcome {
        Ok(elapsed) => complete_success(ctx, &task, handler, elapsed).await,
        Err(AttemptOutcome::HandlerFailure(err)) => complete_failure(ctx, &task, handler, err).await,
        Err(AttemptOutcome::Cancelled(CancelReason::User)) => {
            complete_cancellation(ctx, &task, EngineError::UserCancellation, "cancelled by caller").await
        }
        Err(AttemptOutcome::Cancelled(CancelReason::ServiceStopped)) => {
            complete_cancellation(ctx, &task, EngineError::ServiceShutdownCancellation, "service shutting down").await
        }
        Err(AttemptOutcome::Cancelled(CancelReason::Timeout)) => {
            complete_cancellation(ctx, &task, EngineError::Timeout, "timed out").await
        }
    }
}

enum AttemptError {
    Handler(anyhow::Error),
    Cancelled(CancelReason),
}

enum AttemptOutcome {
    HandlerFailure(anyhow::Error),
    Cancelled(CancelReason),
}

/// Races the handler against cancellation and, if `timeout` is set, against
/// a timer on the same footing — a timeout fires by cancelling the task's
/// own token through `cancellations`, so a handler written the documented
/// cooperative way (`cancel.cancelled().await`) sees a timeout exactly like
/// any other cancellation source.
async fn run_attempt(
    handler: &crate::registry::HandlerEntry,
    task_id: TaskId,
    payload: &serde_json::Value,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    cancellations: &CancellationRegistry,
) -> Result<(), AttemptError> {
    let handler_future = handler.handle(task_id, payload, cancel.clone());

    let result = match timeout {
        Some(duration) => {
            tokio::select! {
                result = handler_future => Some(result),
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(duration) => {
                    cancellations.cancel(&task_id, CancelReason::Timeout);
                    None
                }
            }
        }
        None => {
            tokio::select! {
                result = handler_future => Some(result),
                _ = cancel.cancelled() => None,
            }
        }
    };

    match result {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => Err(AttemptError::Handler(err)),
        // A recorded reason means either `Dispatcher::cancel` or the timer
        // above fired; its absence means the root shutdown token cancelled
        // this child directly.
        None => Err(AttemptError::Cancelled(
            cancellations.reason(&task_id).unwrap_or(CancelReason::ServiceStopped),
        )),
    }
}

async fn complete_success(
    ctx: &ExecutorContext,
    task: &shared::PersistedTask,
    handler: &crate::registry::HandlerEntry,
    elapsed: Duration,
) -> Result<(), EngineError> {
    handler.on_completed(task.id).await;

    let next_run = task
        .recurring_spec
        .as_ref()
        .filter(|_| !task.bounds_exhausted(chrono::Utc::now()))
        .and_then(|spec| spec.calculate_next_run(chrono::Utc::now(), task.current_run_count + 1));

    if task.is_recurring {
        ctx.store
            .update_current_run(task.id, TaskStatus::Completed, Some(elapsed.as_millis() as u64), next_run, None)
            .await?;
        if let Some(next_run) = next_run {
            ctx.store.set_status(task.id, TaskStatus::WaitingQueue, None).await?;
            ctx.scheduler.schedule(task.id, next_run, task.queue_name.clone()).await;
        }
    } else {
        ctx.store
            .update_current_run(task.id, TaskStatus::Completed, Some(elapsed.as_millis() as u64), None, None)
            .await?;
        ctx.store.set_completed(task.id).await?;
    }

    ctx.events
        .publish(TaskEvent::new(
            task.id,
            EventSeverity::Information,
            &task.request_type_name,
            &task.handler_type_name,
            task.request_payload.clone(),
            "completed",
        ))
        .await;
    Ok(())
}

async fn complete_failure(
    ctx: &ExecutorContext,
    task: &shared::PersistedTask,
    handler: &crate::registry::HandlerEntry,
    err: anyhow::Error,
) -> Result<(), EngineError> {
    handler.on_error(task.id, &err).await;

    ctx.store
        .update_current_run(task.id, TaskStatus::Failed, None, None, Some(err.to_string()))
        .await?;

    if task.is_recurring {
        let next_run = task
            .recurring_spec
            .as_ref()
            .filter(|_| !task.bounds_exhausted(chrono::Utc::now()))
            .and_then(|spec| spec.calculate_next_run(chrono::Utc::now(), task.current_run_count + 1));
        if let Some(next_run) = next_run {
            ctx.store.set_status(task.id, TaskStatus::WaitingQueue, None).await?;
            ctx.scheduler.schedule(task.id, next_run, task.queue_name.clone()).await;
        } else {
            ctx.store.set_status(task.id, TaskStatus::Failed, Some(err.to_string())).await?;
        }
    } else {
        ctx.store.set_status(task.id, TaskStatus::Failed, Some(err.to_string())).await?;
    }

    ctx.events
        .publish(TaskEvent::new(
            task.id,
            EventSeverity::Error,
            &task.request_type_name,
            &task.handler_type_name,
            task.request_payload.clone(),
            "failed",
        ).with_exception(err.to_string()))
        .await;
    warn!(task_id = %task.id, error = %err, "task failed");
    Ok(())
}

async fn complete_cancellation(
    ctx: &ExecutorContext,
    task: &shared::PersistedTask,
    reason: EngineError,
    message: &str,
) -> Result<(), EngineError> {
    let status = if matches!(reason, EngineError::ServiceShutdownCancellation) {
        TaskStatus::ServiceStopped
    } else {
        TaskStatus::Cancelled
    };
    ctx.store.set_status(task.id, status, Some(reason.to_string())).await?;

    ctx.events
        .publish(TaskEvent::new(
            task.id,
            EventSeverity::Warning,
            &task.request_type_name,
            &task.handler_type_name,
            task.request_payload.clone(),
            message,
        ))
        .await;
    Ok(())
}
