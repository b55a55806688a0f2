//! Sync event surface
//!
//! Collaborators (UI badges, list refreshers) subscribe here instead of
//! polling. Dropping a [`Subscription`] detaches it immediately.

use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast ring; slow subscribers see `Lagged` beyond this
const EVENT_CAPACITY: usize = 64;

/// Events emitted by the sync core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A flush pass over a non-empty queue finished
    SyncComplete { synced: usize, total: usize },
    /// Number of pending mutations changed
    QueueDepthChanged(usize),
    /// Online state flipped
    ConnectivityChanged(bool),
    /// A mutation gave up retrying and was moved aside
    MutationDeadLettered {
        mutation_id: String,
        item_id: String,
        error: String,
    },
}

/// Cloneable handle for emitting and subscribing to [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Emit an event; having no subscribers is fine
    pub fn emit(&self, event: SyncEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to the event bus
pub struct Subscription {
    rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    ///
    /// Events missed because this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    trace!(missed, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Detach from the bus
    pub fn unsubscribe(self) {}
}
