//! Event bridge: republishes every real-time event on an in-process
//! broadcast channel so non-connection consumers (bots, audit, webhooks)
//! see the same stream clients do.

use chrono::{DateTime, Utc};
use fanout_core::{ConnectionId, RealtimeEvent, RoomId, UserId};
use futures::{Stream, StreamExt};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use crate::metrics::BRIDGE_EVENTS_TOTAL;

/// Default channel capacity; slower subscribers skip ahead.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 1024;

/// Who an event was addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum EventTarget {
    /// Every connection.
    All,
    /// Members of a room.
    Room(RoomId),
    /// Every connection of one user.
    User(UserId),
    /// A single connection.
    Connection(ConnectionId),
}

/// An event as seen by bridge subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgedEvent {
    /// Addressee.
    pub target: EventTarget,
    /// The event itself.
    pub event: RealtimeEvent,
    /// When it was published.
    pub emitted_at: DateTime<Utc>,
}

/// Publisher side of the bridge.
pub struct EventBridge {
    tx: broadcast::Sender<BridgedEvent>,
}

impl EventBridge {
    /// Create a bridge whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers it reached; zero
    /// subscribers is not an error.
    pub fn publish(&self, target: EventTarget, event: RealtimeEvent) -> usize {
        counter!(BRIDGE_EVENTS_TOTAL).increment(1);
        let event_type = event.event_type();
        let receivers = self
            .tx
            .send(BridgedEvent {
                target,
                event,
                emitted_at: Utc::now(),
            })
            .unwrap_or(0);
        debug!(event_type, receivers, "event bridged");
        receivers
    }

    /// Open a new subscription. Only events published afterwards are seen.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_CAPACITY)
    }
}

/// A cancellable subscription handle. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<BridgedEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the bridge is gone. Events missed while
    /// lagging are skipped with a warning.
    pub async fn recv(&mut self) -> Option<BridgedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BridgedEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event subscription lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Convert into a `Stream`, skipping lagged gaps.
    pub fn into_stream(self) -> impl Stream<Item = BridgedEvent> + Send + Unpin {
        BroadcastStream::new(self.rx).filter_map(|item| {
            std::future::ready(match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                    None
                }
            })
        })
    }
}
