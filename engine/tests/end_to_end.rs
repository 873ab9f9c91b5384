//! End-to-end scenarios exercising the engine through its public API only:
//! dispatch, start, and the handler lifecycle.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use engine::{
    DispatchOptions, EngineConfig, LinearRetryPolicy, MemoryStore, RecurringSpec, RetryFilter,
    TaskEngine, TaskHandler, TaskId, TaskStatus, TaskStore,
};

#[derive(Debug, Serialize, Deserialize)]
struct Noop;

/// Polls `condition` until it returns `true` or `timeout` elapses.
async fn wait_until<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// Scenario 1: immediate execution.

struct ImmediateHandler {
    ran: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<Noop> for ImmediateHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn immediate_task_completes() {
    let config = EngineConfig::builder().build().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    let ran = Arc::new(AtomicU32::new(0));
    engine.register_handler::<Noop, _>(ImmediateHandler { ran: ran.clone() });
    engine.start().await.unwrap();

    let task_id = engine.dispatch(&Noop, DispatchOptions::default()).await.unwrap();
    wait_until(|| async { ran.load(Ordering::SeqCst) == 1 }, Duration::from_secs(2)).await;

    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

// Scenario 2: fails twice, succeeds on the third attempt.

#[derive(Debug, thiserror::Error)]
#[error("transient failure")]
struct Transient;

struct FlakyHandler {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<Noop> for FlakyHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < 3 {
            anyhow::bail!(Transient);
        }
        Ok(())
    }
}

#[tokio::test]
async fn retries_until_success() {
    let config = EngineConfig::builder()
        .set_default_retry_policy(Arc::new(LinearRetryPolicy::fixed(5, Duration::from_millis(5)).unwrap()))
        .build()
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    let attempts = Arc::new(AtomicU32::new(0));
    engine.register_handler::<Noop, _>(FlakyHandler { attempts: attempts.clone() });
    engine.start().await.unwrap();

    let task_id = engine.dispatch(&Noop, DispatchOptions::default()).await.unwrap();

    wait_until(
        || async {
            store
                .get(task_id)
                .await
                .unwrap()
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

// Scenario 3: a whitelist retry filter fails fast on a non-matching error.

#[derive(Debug, thiserror::Error)]
#[error("permanent failure")]
struct Permanent;

struct AlwaysFailsHandler {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<Noop> for AlwaysFailsHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!(Permanent)
    }
}

#[tokio::test]
async fn unwhitelisted_error_fails_without_retrying() {
    let policy = LinearRetryPolicy::fixed(5, Duration::from_millis(5))
        .unwrap()
        .with_filter(RetryFilter::all().handle::<Transient>().unwrap());
    let config = EngineConfig::builder()
        .set_default_retry_policy(Arc::new(policy))
        .build()
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    let attempts = Arc::new(AtomicU32::new(0));
    engine.register_handler::<Noop, _>(AlwaysFailsHandler { attempts: attempts.clone() });
    engine.start().await.unwrap();

    let task_id = engine.dispatch(&Noop, DispatchOptions::default()).await.unwrap();

    wait_until(
        || async {
            store
                .get(task_id)
                .await
                .unwrap()
                .map(|t| t.status == TaskStatus::Failed)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

// Scenario 4: a recurring task stops after its max_runs bound.

struct CountingHandler {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<Noop> for CountingHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn recurring_task_stops_after_max_runs() {
    let config = EngineConfig::builder().build().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    let runs = Arc::new(AtomicU32::new(0));
    engine.register_handler::<Noop, _>(CountingHandler { runs: runs.clone() });
    engine.start().await.unwrap();

    let recurring = RecurringSpec::every_seconds(0).with_max_runs(3);
    let options = DispatchOptions {
        recurring: Some(recurring),
        ..Default::default()
    };
    let task_id = engine.dispatch(&Noop, options).await.unwrap();

    wait_until(
        || async {
            store
                .get(task_id)
                .await
                .unwrap()
                .map(|t| t.status.is_terminal())
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.current_run_count, 3);
}

// Scenario 5: cancellation before the task is ever picked up.

struct NeverCalledHandler;

#[async_trait]
impl TaskHandler<Noop> for NeverCalledHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, _cancel: CancellationToken) -> anyhow::Result<()> {
        panic!("handler must never run for a pre-execution cancellation");
    }
}

#[tokio::test]
async fn cancelling_before_due_time_prevents_execution() {
    let config = EngineConfig::builder().build().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    engine.register_handler::<Noop, _>(NeverCalledHandler);
    engine.start().await.unwrap();

    let options = DispatchOptions {
        scheduled_execution_utc: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        ..Default::default()
    };
    let task_id = engine.dispatch(&Noop, options).await.unwrap();

    engine.cancel(task_id).await.unwrap();
    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
}

// Scenario 6: service shutdown mid-execution is observed by the handler's
// cancellation token and the task ends up ServiceStopped, not Completed.

struct ShutdownAwareHandler {
    entered: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl TaskHandler<Noop> for ShutdownAwareHandler {
    async fn handle(&self, _task_id: TaskId, _request: &Noop, cancel: CancellationToken) -> anyhow::Result<()> {
        self.entered.notify_one();
        cancel.cancelled().await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_mid_execution_marks_task_service_stopped() {
    let config = EngineConfig::builder()
        .set_shutdown_grace_period(Duration::from_millis(300))
        .build()
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut engine = TaskEngine::new(config, store.clone());
    let entered = Arc::new(tokio::sync::Notify::new());
    engine.register_handler::<Noop, _>(ShutdownAwareHandler { entered: entered.clone() });
    engine.start().await.unwrap();

    let task_id = engine.dispatch(&Noop, DispatchOptions::default()).await.unwrap();
    entered.notified().await;
    engine.shutdown().await;

    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::ServiceStopped);
}
