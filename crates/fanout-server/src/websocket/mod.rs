//! WebSocket hub, per-client connection state, heartbeat and sessions.

pub mod connection;
pub mod heartbeat;
pub mod hub;
pub mod session;

pub use hub::Hub;
pub use session::{SessionSettings, run_ws_session};
