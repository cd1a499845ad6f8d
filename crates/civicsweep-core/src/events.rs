//! Sync events published to the presentation layer.
//!
//! Components publish `SyncEvent`s on a broadcast channel; the UI subscribes
//! and decides how (or whether) to render them. Publishing never blocks and
//! never fails when nobody is listening.

use tokio::sync::broadcast;
use tracing::trace;

use crate::queue::QueueStatus;

/// Broadcast channel capacity. Slow subscribers skip ahead rather than
/// stall publishers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A remote call started (global progress indicator on)
    ProgressStarted,
    /// A remote call finished, successfully or not
    ProgressStopped,
    /// Queue status was recomputed
    Status(QueueStatus),
    /// A forced flush was requested while offline (rate-limited)
    OfflineNotice,
    /// The queue drained completely; carries the number of items sent
    FlushSucceeded(usize),
    /// The current view should reload its data
    RefreshView,
    /// The session token expired or no longer matches its session
    SessionExpired(String),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        trace!(?event, "Publishing sync event");
        // No receivers is not an error
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
