//! Handler registry: maps a stable request-type name to a decoder and a
//! handler factory.
//!
//! Rust has no runtime reflection to discover implementors of a trait, so
//! there's no way to scan for handlers the way a reflection-capable runtime
//! would. Instead this is a plain map populated by explicit
//! `register::<Req, H>()` calls at startup — auditable, and the type name is
//! derived once at registration time rather than re-parsed on every dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shared::{RetryPolicy, TaskId};

/// User-implemented task logic for one request type.
///
/// All methods besides `handle` are optional lifecycle hooks with no-op
/// default bodies; implementors override only what they need.
#[async_trait]
pub trait TaskHandler<Req>: Send + Sync + 'static {
    async fn handle(&self, task_id: TaskId, request: &Req, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn on_started(&self, _task_id: TaskId) {}
    async fn on_completed(&self, _task_id: TaskId) {}
    async fn on_error(&self, _task_id: TaskId, _error: &anyhow::Error) {}
    async fn on_retry(&self, _task_id: TaskId, _attempt: u32, _error: &anyhow::Error, _delay: std::time::Duration) {}
    async fn dispose(&self, _task_id: TaskId) {}

    /// Override the engine's default retry policy for every task dispatched
    /// against this handler. `None` (the default) defers to
    /// `EngineConfig::default_retry_policy`.
    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        None
    }
}

/// Type-erased entry stored in the registry. Bridges a concrete
/// `TaskHandler<Req>` to the executor's JSON-payload, `dyn Any`-erased world.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle_erased(
        &self,
        task_id: TaskId,
        payload: &Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
    async fn on_started_erased(&self, task_id: TaskId);
    async fn on_completed_erased(&self, task_id: TaskId);
    async fn on_error_erased(&self, task_id: TaskId, error: &anyhow::Error);
    async fn on_retry_erased(&self, task_id: TaskId, attempt: u32, error: &anyhow::Error, delay: std::time::Duration);
    async fn dispose_erased(&self, task_id: TaskId);
    fn retry_policy_erased(&self) -> Option<Arc<dyn RetryPolicy>>;
}

struct TypedHandler<Req, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn() -> Req>,
}

#[async_trait]
impl<Req, H> ErasedHandler for TypedHandler<Req, H>
where
    Req: DeserializeOwned + Serialize + Send + Sync + 'static,
    H: TaskHandler<Req>,
{
    async fn handle_erased(
        &self,
        task_id: TaskId,
        payload: &Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let request: Req = serde_json::from_value(payload.clone())?;
        self.handler.handle(task_id, &request, cancel).await
    }

    async fn on_started_erased(&self, task_id: TaskId) {
        self.handler.on_started(task_id).await;
    }

    async fn on_completed_erased(&self, task_id: TaskId) {
        self.handler.on_completed(task_id).await;
    }

    async fn on_error_erased(&self, task_id: TaskId, error: &anyhow::Error) {
        self.handler.on_error(task_id, error).await;
    }

    async fn on_retry_erased(&self, task_id: TaskId, attempt: u32, error: &anyhow::Error, delay: std::time::Duration) {
        self.handler.on_retry(task_id, attempt, error, delay).await;
    }

    async fn dispose_erased(&self, task_id: TaskId) {
        self.handler.dispose(task_id).await;
    }

    fn retry_policy_erased(&self) -> Option<Arc<dyn RetryPolicy>> {
        self.handler.retry_policy()
    }
}

/// A resolved handler ready to run against a JSON payload.
pub struct HandlerEntry {
    erased: Arc<dyn ErasedHandler>,
    pub handler_type_name: &'static str,
}

impl HandlerEntry {
    pub async fn handle(&self, task_id: TaskId, payload: &Value, cancel: CancellationToken) -> anyhow::Result<()> {
        self.erased.handle_erased(task_id, payload, cancel).await
    }

    pub async fn on_started(&self, task_id: TaskId) {
        self.erased.on_started_erased(task_id).await;
    }

    pub async fn on_completed(&self, task_id: TaskId) {
        self.erased.on_completed_erased(task_id).await;
    }

    pub async fn on_error(&self, task_id: TaskId, error: &anyhow::Error) {
        self.erased.on_error_erased(task_id, error).await;
    }

    pub async fn on_retry(&self, task_id: TaskId, attempt: u32, error: &anyhow::Error, delay: std::time::Duration) {
        self.erased.on_retry_erased(task_id, attempt, error, delay).await;
    }

    pub async fn dispose(&self, task_id: TaskId) {
        self.erased.dispose_erased(task_id).await;
    }

    /// The handler's own retry policy, if it declared one.
    pub fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        self.erased.retry_policy_erased()
    }
}

/// Maps stable request-type names to registered handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<&'static str, HandlerEntry>,
}

/// Canonical name for a request type: the last path segment of
/// `std::any::type_name::<Req>()`, e.g. `my_crate::requests::SendEmail` → `SendEmail`.
pub fn request_type_name<Req: ?Sized + Any>() -> &'static str {
    let full = std::any::type_name::<Req>();
    full.rsplit("::").next().unwrap_or(full)
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Register `H` as the handler for request type `Req`. A second call for
    /// the same `Req` replaces the first.
    pub fn register<Req, H>(&mut self, handler: H)
    where
        Req: DeserializeOwned + Serialize + Send + Sync + 'static,
        H: TaskHandler<Req>,
    {
        let name = request_type_name::<Req>();
        let handler_type_name = std::any::type_name::<H>().rsplit("::").next().unwrap_or("handler");
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler {
            handler,
            _marker: std::marker::PhantomData,
        });
        self.entries.insert(name, HandlerEntry { erased, handler_type_name });
    }

    pub fn resolve(&self, request_type_name: &str) -> Option<&HandlerEntry> {
        self.entries.get(request_type_name)
    }

    pub fn is_registered(&self, request_type_name: &str) -> bool {
        self.entries.contains_key(request_type_name)
    }
}
