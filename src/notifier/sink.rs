//! Event sinks consumed by the notifier worker.

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::notifier::events::CacheEvent;

/// Destination of published cache events
///
/// `publish` runs on the notifier worker, never under a cache lock, so an
/// implementation may call back into the cache.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CacheEvent);
}

/// Fans events out to any number of in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CacheEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }
}

/// Writes every event to the tracing pipeline
#[derive(Debug, Clone, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, event: CacheEvent) {
        match &event {
            CacheEvent::Audit(record) => {
                warn!(
                    audit_id = %record.id,
                    service_id = %record.service_id,
                    kind = ?record.kind,
                    "{}", record.message
                );
            }
            other => match serde_json::to_string(other) {
                Ok(json) => info!(event = %json, "Cache event"),
                Err(e) => warn!("Failed to serialize cache event: {}", e),
            },
        }
    }
}

/// Publishes each event to every inner sink in order
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for CompositeEventSink {
    fn publish(&self, event: CacheEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
