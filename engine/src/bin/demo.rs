//! Minimal end-to-end demonstration: register a handler, start the engine,
//! dispatch a task, and watch it complete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use engine::{DispatchOptions, EngineConfig, TaskEngine, TaskHandler, TaskId};

#[derive(Debug, Serialize, Deserialize)]
struct SendWelcomeEmail {
    recipient: String,
}

struct SendWelcomeEmailHandler;

#[async_trait]
impl TaskHandler<SendWelcomeEmail> for SendWelcomeEmailHandler {
    async fn handle(&self, task_id: TaskId, request: &SendWelcomeEmail, _cancel: CancellationToken) -> anyhow::Result<()> {
        info!(task_id = %task_id, recipient = %request.recipient, "sending welcome email");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("engine=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = EngineConfig::builder().build()?;
    let store = Arc::new(engine::MemoryStore::new());
    let mut task_engine = TaskEngine::new(config, store);
    task_engine.register_handler::<SendWelcomeEmail, _>(SendWelcomeEmailHandler);
    task_engine.start().await?;

    let task_id = task_engine
        .dispatch(&SendWelcomeEmail { recipient: "ada@example.com".into() }, DispatchOptions::default())
        .await?;
    info!(task_id = %task_id, "dispatched welcome email task");

    tokio::time::sleep(Duration::from_millis(200)).await;
    task_engine.shutdown().await;
    Ok(())
}
