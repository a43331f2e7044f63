//! Transport error types.

use thiserror::Error;

use crate::ids::ConnectionId;

/// Errors raised by a [`RealtimeInstance`](crate::transport::RealtimeInstance).
///
/// These are transient operational errors: callers that fan out across
/// several instances log them per instance and carry on.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is not attached to this instance.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The event could not be handed to the connection's send channel.
    #[error("failed to send to connection {connection_id}: {reason}")]
    SendFailed {
        /// Target connection.
        connection_id: ConnectionId,
        /// Why delivery failed (channel full, closed).
        reason: String,
    },

    /// The instance has been shut down.
    #[error("instance is closed")]
    Closed,

    /// Enumerating live connections failed.
    #[error("failed to enumerate connections: {0}")]
    Enumerate(String),

    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
