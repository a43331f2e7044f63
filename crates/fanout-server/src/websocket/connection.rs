//! Per-client state held by a [`Hub`](super::Hub).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fanout_core::{ConnectionId, ConnectionIdentity, RealtimeEvent, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One connected client: its identity, bounded outbound queue and liveness.
///
/// The queue holds pre-serialized frames so a room broadcast serializes once
/// and shares the `Arc` across recipients.
pub struct ClientConnection {
    identity: ConnectionIdentity,
    outbound: mpsc::Sender<Arc<String>>,
    opened_at: Instant,
    last_seen: Mutex<Instant>,
    dropped: AtomicU64,
    closer: CancellationToken,
}

impl ClientConnection {
    /// Wrap an identity and the sending half of the client's outbound queue.
    pub fn new(identity: ConnectionIdentity, outbound: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            identity,
            outbound,
            opened_at: now,
            last_seen: Mutex::new(now),
            dropped: AtomicU64::new(0),
            closer: CancellationToken::new(),
        }
    }

    /// Connection handle.
    pub fn id(&self) -> &ConnectionId {
        &self.identity.connection_id
    }

    /// User attached upstream, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        self.identity.user_id.as_ref()
    }

    /// Full identity.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Queue a frame without waiting. A full or closed queue drops the
    /// frame and bumps the drop counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Serialize and queue a single event.
    pub fn send_event(&self, event: &RealtimeEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(error) => {
                warn!(connection_id = %self.id(), %error, "event serialization failed");
                false
            }
        }
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame, including Pong).
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client was last heard from.
    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Ask the session driving this connection to close it.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Token cancelled by [`close`](Self::close).
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}
