//! Publish/subscribe channel shared by the sync components.
//!
//! The bus is created once and handed to every component that publishes or
//! listens, instead of living in a process-wide global.

use crate::connectivity::ConnectivityState;
use crate::processor::DrainReport;
use crate::warmer::SyncSummary;
use fieldsync_types::StatusKey;
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the sync components.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connectivity classification changed.
    ConnectivityChanged(ConnectivityState),
    /// A drain replayed at least one item successfully.
    SyncCompleted(DrainReport),
    /// Delayed second signal after `SyncCompleted`, for views that depend on
    /// state written slightly later.
    SyncCompletedFollowUp,
    /// The cache warmer refreshed at least one collection.
    ReferenceDataRefreshed(SyncSummary),
    /// A derived status entry was written.
    StatusChanged(StatusKey),
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Returns the number of subscribers reached; having
    /// none is not an error.
    pub fn publish(&self, event: SyncEvent) -> usize {
        trace!("Publishing {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
