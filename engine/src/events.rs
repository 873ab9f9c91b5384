//! Fire-and-forget event fan-out.
//!
//! `tokio::sync::broadcast` is the natural fit: a lagging subscriber drops
//! old events instead of back-pressuring the executor, which matches the
//! contract that event delivery must never affect task execution. `EventSink`
//! lets a host register a synchronous/async adapter (a metrics counter, say)
//! without depending on the broadcast API directly.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use shared::TaskEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A host-registered adapter that receives every emitted event. Errors are
/// caught and logged by the publisher; they never propagate to the caller
/// that triggered the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

/// Process-local event bus. Cloning shares the same underlying channel.
pub struct EventPublisher {
    sender: broadcast::Sender<TaskEvent>,
    sinks: tokio::sync::RwLock<Vec<Box<dyn EventSink>>>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventPublisher {
            sender,
            sinks: tokio::sync::RwLock::new(Vec::new()),
        }
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        EventPublisher::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub async fn register_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Publish an event. Broadcast send failures (no subscribers) and sink
    /// failures are both swallowed after logging — this must never be allowed
    /// to affect the caller's task execution.
    pub async fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event.clone());

        let sinks = self.sinks.read().await;
        for sink in sinks.iter() {
            if let Err(err) = sink.handle(&event).await {
                warn!(task_id = %event.task_id, error = %err, "event sink failed");
            }
        }
    }
}
