//! In-process WebSocket hub: one real-time server instance.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fanout_core::errors::Result;
use fanout_core::{
    ConnectionId, ConnectionIdentity, ConnectionLifecycle, RealtimeEvent, RealtimeInstance,
    RoomId, TransportError,
};
use metrics::counter;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ClientConnection;
use crate::metrics::{WS_BROADCAST_DROPS_TOTAL, WS_SLOW_CLIENT_DISCONNECTS_TOTAL};

/// Capacity of the lifecycle broadcast channel.
const LIFECYCLE_CAPACITY: usize = 1024;

/// Connected clients and room membership for one instance.
pub struct Hub {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    lifecycle: broadcast::Sender<ConnectionLifecycle>,
    /// Drops tolerated before a client is disconnected as too slow.
    max_dropped_messages: u64,
    closed: CancellationToken,
}

impl Hub {
    /// Create an empty hub.
    pub fn new(max_dropped_messages: u64) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            lifecycle,
            max_dropped_messages,
            closed: CancellationToken::new(),
        }
    }

    /// Attach a connection and announce it on the lifecycle channel.
    ///
    /// A connection with an id that is already attached replaces the old
    /// one, which is closed. Rooms do not carry over: the replacement starts
    /// with no memberships.
    pub fn register(&self, connection: Arc<ClientConnection>) -> Result<()> {
        self.check_open()?;
        let identity = connection.identity().clone();
        let previous = self
            .connections
            .insert(identity.connection_id.clone(), Arc::clone(&connection));

        // `shutdown` cancels before it snapshots, so an insert that lands
        // after the snapshot sees the hub closed here.
        if self.is_closed() {
            let _ = self
                .connections
                .remove_if(&identity.connection_id, |_, current| {
                    Arc::ptr_eq(current, &connection)
                });
            connection.close();
            if let Some(previous) = previous {
                previous.close();
            }
            return Err(TransportError::Closed);
        }

        if let Some(previous) = previous {
            warn!(connection_id = %identity.connection_id, "duplicate connection id, closing previous");
            previous.close();
            self.leave_all_rooms(&identity.connection_id);
            let _ = self
                .lifecycle
                .send(ConnectionLifecycle::Closed(previous.identity().clone()));
        }
        debug!(connection_id = %identity.connection_id, "connection registered");
        let _ = self.lifecycle.send(ConnectionLifecycle::Opened(identity));
        Ok(())
    }

    /// Detach a connection, drop its room memberships and announce the
    /// close. Returns `false` if it was not attached.
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        match self.connections.remove(connection_id) {
            Some((_, connection)) => {
                self.detached(&connection);
                true
            }
            None => false,
        }
    }

    /// Detach `connection` only if it is still the one registered under
    /// its id. Sessions call this on exit so a replacement that reused the
    /// id stays attached.
    pub fn release(&self, connection: &Arc<ClientConnection>) -> bool {
        match self
            .connections
            .remove_if(connection.id(), |_, current| Arc::ptr_eq(current, connection))
        {
            Some((_, connection)) => {
                self.detached(&connection);
                true
            }
            None => false,
        }
    }

    fn leave_all_rooms(&self, connection_id: &ConnectionId) {
        self.rooms.retain(|_, members| {
            let _ = members.remove(connection_id);
            !members.is_empty()
        });
    }

    fn detached(&self, connection: &ClientConnection) {
        let connection_id = connection.id();
        self.leave_all_rooms(connection_id);
        debug!(%connection_id, "connection unregistered");
        let _ = self
            .lifecycle
            .send(ConnectionLifecycle::Closed(connection.identity().clone()));
    }

    /// Look up an attached connection.
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(&c))
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether [`shutdown`](RealtimeInstance::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Hand a serialized event to one client. A client whose drop count
    /// passes the limit is closed.
    fn deliver(&self, connection: &ClientConnection, payload: &Arc<String>) -> bool {
        if connection.send(Arc::clone(payload)) {
            return true;
        }
        counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
        let drops = connection.drop_count();
        if drops > self.max_dropped_messages && !connection.is_closed() {
            warn!(connection_id = %connection.id(), drops, "disconnecting slow client");
            counter!(WS_SLOW_CLIENT_DISCONNECTS_TOTAL).increment(1);
            connection.close();
        } else {
            debug!(connection_id = %connection.id(), drops, "send buffer full, event dropped");
        }
        false
    }

    fn deliver_all<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        payload: &Arc<String>,
    ) -> usize {
        let mut delivered = 0;
        for connection_id in targets {
            if let Some(connection) = self.connection(connection_id) {
                if self.deliver(&connection, payload) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }
}

fn encode(event: &RealtimeEvent) -> Result<Arc<String>> {
    Ok(Arc::new(serde_json::to_string(event)?))
}

#[async_trait]
impl RealtimeInstance for Hub {
    fn lifecycle(&self) -> broadcast::Receiver<ConnectionLifecycle> {
        self.lifecycle.subscribe()
    }

    async fn emit_to_all(&self, event: &RealtimeEvent) -> Result<usize> {
        self.check_open()?;
        let payload = encode(event)?;
        let delivered = self
            .snapshot()
            .iter()
            .filter(|c| self.deliver(c, &payload))
            .count();
        debug!(event_type = event.event_type(), delivered, "event sent to all");
        Ok(delivered)
    }

    async fn emit_to_room(
        &self,
        room: &RoomId,
        event: &RealtimeEvent,
        exclude: Option<&ConnectionId>,
    ) -> Result<usize> {
        self.check_open()?;
        let payload = encode(event)?;
        let members: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|m| m.iter().filter(|id| Some(*id) != exclude).cloned().collect())
            .unwrap_or_default();
        let delivered = self.deliver_all(&members, &payload);
        debug!(%room, event_type = event.event_type(), delivered, "event sent to room");
        Ok(delivered)
    }

    async fn emit_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &RealtimeEvent,
    ) -> Result<()> {
        self.check_open()?;
        let connection = self
            .connection(connection_id)
            .ok_or_else(|| TransportError::ConnectionNotFound(connection_id.clone()))?;
        if self.deliver(&connection, &encode(event)?) {
            Ok(())
        } else {
            Err(TransportError::SendFailed {
                connection_id: connection_id.clone(),
                reason: "send buffer full or closed".into(),
            })
        }
    }

    async fn connections(&self) -> Result<Vec<ConnectionIdentity>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self
            .connections
            .iter()
            .map(|c| c.identity().clone())
            .collect())
    }

    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<()> {
        let connection = self
            .connection(connection_id)
            .ok_or_else(|| TransportError::ConnectionNotFound(connection_id.clone()))?;
        connection.close();
        let _ = self.unregister(connection_id);
        Ok(())
    }

    async fn join_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        self.check_open()?;
        let connection = self
            .connection(connection_id)
            .ok_or_else(|| TransportError::ConnectionNotFound(connection_id.clone()))?;
        let _ = self
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id.clone());
        debug!(%connection_id, %room, "joined room");
        let _ = connection.send_event(&RealtimeEvent::RoomJoined {
            room_id: room.clone(),
            connection_id: connection_id.clone(),
        });
        Ok(())
    }

    async fn leave_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        let mut removed = false;
        if let Some(mut members) = self.rooms.get_mut(room) {
            removed = members.remove(connection_id);
        }
        let _ = self.rooms.remove_if(room, |_, members| members.is_empty());
        if removed {
            debug!(%connection_id, %room, "left room");
        }
        if let Some(connection) = self.connection(connection_id) {
            let _ = connection.send_event(&RealtimeEvent::RoomLeft {
                room_id: room.clone(),
                connection_id: connection_id.clone(),
            });
        }
        Ok(())
    }

    async fn room_members(&self, room: &RoomId) -> Result<Vec<ConnectionId>> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        for connection_id in &ids {
            if let Some(connection) = self.connection(connection_id) {
                connection.close();
            }
            let _ = self.unregister(connection_id);
        }
        info!(closed = ids.len(), "hub shut down");
    }
}
