use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::model::AssetId;

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Queued,
    Progress {
        bytes_stored: u64,
        bytes_total: u64,
        segments_stored: usize,
        segments_total: usize,
    },
    Paused,
    Resumed,
    Completed,
    Failed {
        reason: String,
    },
    Cancelled,
    /// A write to the store failed. The asset has been paused.
    StorageError {
        reason: String,
    },
    Deleted,
}

#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub asset: AssetId,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl DownloadEvent {
    pub fn new(asset: AssetId, kind: EventKind) -> Self {
        Self {
            asset,
            kind,
            at: Utc::now(),
        }
    }
}

/// Receives the events of every asset, in the order they were emitted.
///
/// Events are delivered after the engine has released its scheduler lock, so
/// a sink may call back into the engine, for example to look up the asset an
/// event is about. Delivery holds up the caller that emitted the event, so
/// implementations should still return quickly.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &DownloadEvent);
}

impl<F> EventSink for F
where
    F: Fn(&DownloadEvent) + Send + Sync + 'static,
{
    fn emit(&self, event: &DownloadEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &DownloadEvent) {
        // the receiver going away only means nobody listens anymore
        _ = self.sender.send(event.clone());
    }
}

/// Logs every event.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &DownloadEvent) {
        let asset = &event.asset;
        match &event.kind {
            EventKind::Progress {
                bytes_stored,
                bytes_total,
                segments_stored,
                segments_total,
            } => tracing::debug!(
                %asset,
                bytes_stored,
                bytes_total,
                "{segments_stored}/{segments_total} segments stored."
            ),
            EventKind::Failed { reason } => tracing::error!(%asset, "Download failed: {reason}"),
            EventKind::StorageError { reason } => {
                tracing::error!(%asset, "Storage error: {reason}")
            }
            kind => tracing::info!(%asset, "{kind:?}"),
        }
    }
}
