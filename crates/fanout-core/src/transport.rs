//! The server-instance abstraction wrapped by the connection pool.
//!
//! A [`RealtimeInstance`] is one running real-time server: it accepts
//! connections (identity already validated upstream), keeps room
//! membership, and delivers [`RealtimeEvent`]s. The pool treats every
//! instance uniformly through this trait, whether it is an in-process
//! WebSocket hub or a test double.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::Result;
use crate::events::{ConnectionIdentity, ConnectionLifecycle, RealtimeEvent};
use crate::ids::{ConnectionId, RoomId};

/// One real-time server instance.
#[async_trait]
pub trait RealtimeInstance: Send + Sync {
    /// Subscribe to connection open/close notifications.
    fn lifecycle(&self) -> broadcast::Receiver<ConnectionLifecycle>;

    /// Deliver an event to every connection. Returns the recipient count.
    async fn emit_to_all(&self, event: &RealtimeEvent) -> Result<usize>;

    /// Deliver an event to every member of a room, optionally skipping one
    /// connection. Returns the recipient count.
    async fn emit_to_room(
        &self,
        room: &RoomId,
        event: &RealtimeEvent,
        exclude: Option<&ConnectionId>,
    ) -> Result<usize>;

    /// Deliver an event to one connection.
    async fn emit_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &RealtimeEvent,
    ) -> Result<()>;

    /// Enumerate live connections with their attached identity.
    async fn connections(&self) -> Result<Vec<ConnectionIdentity>>;

    /// Forcibly close one connection.
    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<()>;

    /// Add a connection to a room.
    async fn join_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()>;

    /// Remove a connection from a room.
    async fn leave_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()>;

    /// Connections currently in a room.
    async fn room_members(&self, room: &RoomId) -> Result<Vec<ConnectionId>>;

    /// Stop accepting connections and release resources.
    async fn shutdown(&self);
}
