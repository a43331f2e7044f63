//! HTTP/WebSocket listener settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Listener and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Interval between server-initiated pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a client after this long without a pong, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub send_buffer: usize,
    /// Lifetime dropped messages after which a slow client is disconnected.
    pub max_dropped_messages: u64,
    /// Message streams with no chunk for this long are ended as incomplete.
    pub stream_idle_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 60_000,
            max_message_size: 1024 * 1024,
            send_buffer: 256,
            max_dropped_messages: 100,
            stream_idle_timeout_ms: 300_000,
        }
    }
}

impl ServerSettings {
    /// Ping period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pong deadline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Idle limit for message streams.
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}
