//! Event types carried by the fan-out layer.
//!
//! - **[`RealtimeEvent`]**: the typed payload delivered to client
//!   connections and to event-bridge subscribers. Serialized with an
//!   internal `"type"` tag and camelCase fields.
//! - **[`ConnectionLifecycle`]**: open/close notifications emitted by a
//!   server instance, consumed by the pool (connection counting) and the
//!   connection service (user maps).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, NodeId, RoomId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// RealtimeEvent
// ─────────────────────────────────────────────────────────────────────────────

/// An event delivered to connected clients.
///
/// Event payloads are opaque to the pool and the balancer; only the
/// connection service and the transport look inside.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    /// A complete message posted to a conversation.
    #[serde(rename = "message.new")]
    MessageNew {
        /// Conversation the message belongs to.
        conversation_id: RoomId,
        /// Message identifier.
        message_id: String,
        /// Author, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
        /// Message body, passed through untouched.
        content: Value,
    },

    /// A streamed message has started.
    #[serde(rename = "message.stream_start")]
    StreamStart {
        /// Conversation the message belongs to.
        conversation_id: RoomId,
        /// Message identifier.
        message_id: String,
        /// When the stream was registered.
        started_at: DateTime<Utc>,
    },

    /// One chunk of a streamed message.
    #[serde(rename = "message.chunk")]
    MessageChunk {
        /// Conversation the message belongs to.
        conversation_id: RoomId,
        /// Message identifier.
        message_id: String,
        /// Chunk text.
        chunk: String,
        /// Whether this is the final chunk.
        is_complete: bool,
    },

    /// A streamed message has finished.
    #[serde(rename = "message.stream_end")]
    StreamEnd {
        /// Conversation the message belongs to.
        conversation_id: RoomId,
        /// Message identifier.
        message_id: String,
        /// Wall-clock duration of the stream in milliseconds.
        duration_ms: u64,
        /// Number of chunks received.
        total_chunks: usize,
        /// Always `true` for a stream that ended normally.
        is_complete: bool,
    },

    /// Typing indicator.
    #[serde(rename = "typing")]
    Typing {
        /// Conversation being typed in.
        conversation_id: RoomId,
        /// Who is typing.
        user_id: UserId,
        /// Started (`true`) or stopped (`false`).
        is_typing: bool,
    },

    /// User presence change.
    #[serde(rename = "presence")]
    Presence {
        /// User whose presence changed.
        user_id: UserId,
        /// Online or offline.
        online: bool,
    },

    /// A connection joined a room.
    #[serde(rename = "room.joined")]
    RoomJoined {
        /// Room joined.
        room_id: RoomId,
        /// Connection that joined.
        connection_id: ConnectionId,
    },

    /// A connection left a room.
    #[serde(rename = "room.left")]
    RoomLeft {
        /// Room left.
        room_id: RoomId,
        /// Connection that left.
        connection_id: ConnectionId,
    },

    /// The instance is going away; clients should reconnect.
    #[serde(rename = "server.maintenance")]
    Maintenance {
        /// Human-readable reason.
        reason: String,
        /// Whether the client should reconnect elsewhere.
        reconnect: bool,
    },

    /// Sent once to a client right after it connects.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        /// The client's connection handle.
        connection_id: ConnectionId,
        /// Instance the client landed on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
    },

    /// Application-defined event with an opaque payload.
    #[serde(rename = "custom")]
    Custom {
        /// Application event name.
        event: String,
        /// Opaque payload.
        payload: Value,
    },
}

impl RealtimeEvent {
    /// Wire name of the event (the `"type"` tag).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageNew { .. } => "message.new",
            Self::StreamStart { .. } => "message.stream_start",
            Self::MessageChunk { .. } => "message.chunk",
            Self::StreamEnd { .. } => "message.stream_end",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::RoomJoined { .. } => "room.joined",
            Self::RoomLeft { .. } => "room.left",
            Self::Maintenance { .. } => "server.maintenance",
            Self::ConnectionEstablished { .. } => "connection.established",
            Self::Custom { .. } => "custom",
        }
    }

    /// Conversation the event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&RoomId> {
        match self {
            Self::MessageNew {
                conversation_id, ..
            }
            | Self::StreamStart {
                conversation_id, ..
            }
            | Self::MessageChunk {
                conversation_id, ..
            }
            | Self::StreamEnd {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            } => Some(conversation_id),
            Self::RoomJoined { room_id, .. } | Self::RoomLeft { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// Shorthand for an application-defined event.
    pub fn custom(event: impl Into<String>, payload: Value) -> Self {
        Self::Custom {
            event: event.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection identity and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Identity attached to a connection before the core sees it.
///
/// Credentials are validated upstream; the core trusts this value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdentity {
    /// The connection handle.
    pub connection_id: ConnectionId,
    /// Authenticated user, if the connection carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl ConnectionIdentity {
    /// Identity for an authenticated user.
    pub fn new(connection_id: impl Into<ConnectionId>, user_id: impl Into<UserId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Identity without a user attached.
    pub fn anonymous(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: None,
        }
    }
}

/// Connection open/close notification from a server instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionLifecycle {
    /// A client connected.
    Opened(ConnectionIdentity),
    /// A client disconnected.
    Closed(ConnectionIdentity),
}

impl ConnectionLifecycle {
    /// Identity of the connection this notification concerns.
    pub fn identity(&self) -> &ConnectionIdentity {
        match self {
            Self::Opened(identity) | Self::Closed(identity) => identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serializes_with_type_tag_and_camel_case() {
        let event = RealtimeEvent::MessageChunk {
            conversation_id: RoomId::from("c1"),
            message_id: "m1".into(),
            chunk: "hi".into(),
            is_complete: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message.chunk");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["messageId"], "m1");
        assert_eq!(value["isComplete"], false);
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = [
            RealtimeEvent::Maintenance {
                reason: "drain".into(),
                reconnect: true,
            },
            RealtimeEvent::Presence {
                user_id: UserId::from("u1"),
                online: true,
            },
            RealtimeEvent::custom("poll.created", serde_json::json!({"id": 4})),
            RealtimeEvent::ConnectionEstablished {
                connection_id: ConnectionId::from("c1"),
                node_id: None,
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn decodes_client_frame() {
        let json = r#"{"type":"typing","conversationId":"c9","userId":"u2","isTyping":true}"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            RealtimeEvent::Typing {
                conversation_id: RoomId::from("c9"),
                user_id: UserId::from("u2"),
                is_typing: true,
            }
        );
    }

    #[test]
    fn conversation_id_for_scoped_events() {
        let event = RealtimeEvent::RoomJoined {
            room_id: RoomId::from("r1"),
            connection_id: ConnectionId::from("c1"),
        };
        assert_eq!(event.conversation_id().map(RoomId::as_str), Some("r1"));
        let global = RealtimeEvent::custom("x", serde_json::Value::Null);
        assert!(global.conversation_id().is_none());
    }

    #[test]
    fn anonymous_identity_omits_user() {
        let identity = ConnectionIdentity::anonymous("c1");
        let value = serde_json::to_value(&identity).unwrap();
        assert_eq!(value["connectionId"], "c1");
        assert!(value.get("userId").is_none());
    }

    #[test]
    fn lifecycle_identity() {
        let identity = ConnectionIdentity::new("c1", "u1");
        let closed = ConnectionLifecycle::Closed(identity.clone());
        assert_eq!(closed.identity(), &identity);
    }
}
