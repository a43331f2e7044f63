//! # fanout-server
//!
//! WebSocket hub, connection service facade and Axum HTTP surface.
//!
//! - **Hub**: in-process [`RealtimeInstance`](fanout_core::RealtimeInstance)
//!   with per-client send buffers, heartbeat, rooms and slow-client eviction
//! - **Service**: [`ConnectionService`] gives one surface over a single hub
//!   or a pool of hubs, plus user presence, the event bridge and
//!   message-stream sessions
//! - **HTTP**: `/health`, `/stats`, `/metrics` and the `/ws` upgrade
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod errors;
pub mod event_bridge;
pub mod health;
pub mod metrics;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod streams;
pub mod websocket;

pub use errors::{FanoutError, Result, ServiceError};
pub use event_bridge::{BridgedEvent, EventBridge, EventSubscription, EventTarget};
pub use server::{AppState, FanoutServer};
pub use service::{ConnectionService, SelectedServer, ServiceMode};
pub use shutdown::{DrainReport, ShutdownCoordinator};
pub use streams::{StreamRegistry, StreamSummary};
pub use websocket::Hub;
