//! # Notifier
//!
//! Decouples "the cache changed" from "announce the change". Mutating cache
//! operations collect a `NotificationBatch` while holding their write lock and
//! hand it here right after releasing it. A single worker task publishes the
//! batches strictly in hand-off order, so a slow or re-entrant `EventSink`
//! never runs under a cache lock.
//!
//! ## Key Features
//! - One worker, one unbounded FIFO queue: batch order across mutations is preserved
//! - `flush()` waits until everything handed off so far has been published
//! - `stop()` drains queued batches before the worker exits

pub mod events;
pub mod sink;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use events::{
    AuditKind, AuditRecord, CacheEvent, EntityKind, InvalidationOp, NotificationBatch, ReloadSummary, Transition,
};
pub use sink::{BroadcastEventSink, CompositeEventSink, EventSink, LoggingEventSink};

enum NotifierMessage {
    Batch(NotificationBatch),
    ReloadCompleted(ReloadSummary),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the notification worker; clones share the same worker
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<NotifierMessage>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Notifier {
    /// Spawn the worker publishing to `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(sink: Arc<dyn EventSink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver, sink));
        Self {
            sender,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Queue the events of one cache mutation; empty batches are dropped
    pub fn dispatch(&self, batch: NotificationBatch) {
        if batch.is_empty() {
            return;
        }
        self.send(NotifierMessage::Batch(batch));
    }

    /// Queue the end-of-pass event of a reconciliation
    pub fn reload_completed(&self, summary: ReloadSummary) {
        self.send(NotifierMessage::ReloadCompleted(summary));
    }

    /// Wait until every batch queued before this call has been published
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(NotifierMessage::Flush(tx));
        let _ = rx.await;
    }

    /// Publish what is queued, then stop the worker
    pub async fn stop(&self) {
        self.send(NotifierMessage::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Notifier worker terminated abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    fn send(&self, message: NotifierMessage) {
        if self.sender.send(message).is_err() {
            debug!("Notifier is stopped, dropping notification");
        }
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<NotifierMessage>, sink: Arc<dyn EventSink>) {
    debug!("Notifier worker started");

    while let Some(message) = receiver.recv().await {
        match message {
            NotifierMessage::Batch(batch) => {
                for event in batch.into_events() {
                    sink.publish(event);
                }
            }
            NotifierMessage::ReloadCompleted(summary) => {
                sink.publish(CacheEvent::ReloadCompleted(summary));
            }
            NotifierMessage::Flush(done) => {
                let _ = done.send(());
            }
            NotifierMessage::Shutdown => break,
        }
    }

    receiver.close();
    while let Ok(message) = receiver.try_recv() {
        match message {
            NotifierMessage::Batch(batch) => batch.into_events().into_iter().for_each(|e| sink.publish(e)),
            NotifierMessage::ReloadCompleted(summary) => sink.publish(CacheEvent::ReloadCompleted(summary)),
            NotifierMessage::Flush(done) => {
                let _ = done.send(());
            }
            NotifierMessage::Shutdown => {}
        }
    }

    info!("Notifier worker stopped");
}
