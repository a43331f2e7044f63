//! # fanout-core
//!
//! Foundation types shared by every fanout crate.
//!
//! - **Branded IDs**: `NodeId`, `ConnectionId`, `UserId`, `RoomId` as newtypes
//! - **Events**: [`RealtimeEvent`](events::RealtimeEvent), the typed payload
//!   delivered to clients, and [`ConnectionLifecycle`](events::ConnectionLifecycle)
//! - **Transport**: the [`RealtimeInstance`](transport::RealtimeInstance) trait
//!   every server instance implements
//! - **Errors**: [`TransportError`](errors::TransportError)
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod transport;

pub use errors::TransportError;
pub use events::{ConnectionIdentity, ConnectionLifecycle, RealtimeEvent};
pub use ids::{ConnectionId, NodeId, RoomId, UserId};
pub use transport::RealtimeInstance;
