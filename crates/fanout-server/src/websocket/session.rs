//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use fanout_core::{ConnectionIdentity, NodeId, RealtimeEvent, RealtimeInstance, RoomId};
use fanout_settings::ServerSettings;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::hub::Hub;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_HEARTBEAT_TIMEOUTS_TOTAL,
};

/// How long the outbound forwarder gets to flush and send a Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Per-session knobs taken from [`ServerSettings`].
#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    /// Interval between server Ping frames and liveness checks.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the client is considered dead.
    pub heartbeat_timeout: Duration,
    /// Capacity of the per-client send channel.
    pub send_buffer: usize,
}

impl From<&ServerSettings> for SessionSettings {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            send_buffer: settings.send_buffer.max(1),
        }
    }
}

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub(crate) enum ClientFrame {
    /// Join a room on this instance.
    #[serde(rename = "room.join")]
    JoinRoom { room_id: RoomId },
    /// Leave a room on this instance.
    #[serde(rename = "room.leave")]
    LeaveRoom { room_id: RoomId },
    /// Typing indicator, relayed to the rest of the room.
    #[serde(rename = "typing")]
    Typing {
        conversation_id: RoomId,
        is_typing: bool,
    },
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection with the hub and sends `connection.established`
/// 2. Forwards outbound events via the send channel, with periodic Pings
/// 3. Applies `room.join` / `room.leave` / `typing` client frames
/// 4. Closes unresponsive or slow clients
/// 5. Detaches from the hub on disconnect
#[instrument(skip_all, fields(connection_id = %identity.connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    identity: ConnectionIdentity,
    hub: Arc<Hub>,
    node_id: Option<NodeId>,
    settings: SessionSettings,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(settings.send_buffer);
    let connection = Arc::new(ClientConnection::new(identity, send_tx));
    let closed = connection.close_token();

    if let Err(error) = hub.register(Arc::clone(&connection)) {
        warn!(%error, "instance refused connection");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    let connection_start = Instant::now();
    info!(user_id = ?connection.user_id(), node_id = ?node_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let _ = connection.send_event(&RealtimeEvent::ConnectionEstablished {
        connection_id: connection.id().clone(),
        node_id,
    });

    let heartbeat = {
        let connection = Arc::clone(&connection);
        let cancel = closed.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(
                Arc::clone(&connection),
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
                cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!(
                    silent_for = ?connection.silent_for(),
                    "client unresponsive, disconnecting"
                );
                counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                connection.close();
            }
        })
    };

    // Outbound forwarder with periodic Ping frames.
    let outbound_closed = closed.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(settings.heartbeat_interval);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
                () = outbound_closed.cancelled() => break,
            }
        }

        // Flush what was queued before the close (maintenance notices).
        while let Ok(text) = send_rx.try_recv() {
            if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = closed.cancelled() => break,
        };
        let Some(Ok(msg)) = frame else { break };
        connection.touch();

        let text = match msg {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    Some(s.to_owned())
                } else {
                    debug!(len = data.len(), "received non-UTF8 binary frame");
                    None
                }
            }
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(text) = text {
            handle_client_frame(&hub, &connection, &text).await;
        }
    }

    // Clean up
    connection.close();
    let _ = hub.release(&connection);
    if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }
    let _ = heartbeat.await;

    info!(
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

/// Apply one text frame from a client. Unknown or malformed frames are
/// ignored.
pub(crate) async fn handle_client_frame(hub: &Hub, connection: &ClientConnection, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(%error, "ignoring unrecognised client frame");
            return;
        }
    };

    let result = match frame {
        ClientFrame::JoinRoom { room_id } => hub.join_room(connection.id(), &room_id).await,
        ClientFrame::LeaveRoom { room_id } => hub.leave_room(connection.id(), &room_id).await,
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            let Some(user_id) = connection.user_id().cloned() else {
                debug!("typing from anonymous connection ignored");
                return;
            };
            let event = RealtimeEvent::Typing {
                conversation_id: conversation_id.clone(),
                user_id,
                is_typing,
            };
            hub.emit_to_room(&conversation_id, &event, Some(connection.id()))
                .await
                .map(|_| ())
        }
    };

    if let Err(error) = result {
        warn!(%error, "client frame rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::ConnectionId;

    fn attach(hub: &Hub, identity: ConnectionIdentity) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(ClientConnection::new(identity, tx));
        hub.register(Arc::clone(&connection)).unwrap();
        (connection, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> serde_json::Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn parse_room_frames() {
        let join: ClientFrame = serde_json::from_str(r#"{"type":"room.join","roomId":"r1"}"#).unwrap();
        assert_eq!(
            join,
            ClientFrame::JoinRoom {
                room_id: RoomId::from("r1")
            }
        );
        let leave: ClientFrame =
            serde_json::from_str(r#"{"type":"room.leave","roomId":"r1"}"#).unwrap();
        assert_eq!(
            leave,
            ClientFrame::LeaveRoom {
                room_id: RoomId::from("r1")
            }
        );
    }

    #[test]
    fn reject_unknown_frame() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"rpc.call"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"room.join"}"#).is_err());
    }

    #[test]
    fn session_settings_from_server_settings() {
        let server = ServerSettings {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
            send_buffer: 0,
            ..ServerSettings::default()
        };
        let settings = SessionSettings::from(&server);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(settings.send_buffer, 1);
    }

    #[tokio::test]
    async fn join_frame_adds_membership() {
        let hub = Hub::new(10);
        let (conn, mut rx) = attach(&hub, ConnectionIdentity::anonymous("c1"));

        handle_client_frame(&hub, &conn, r#"{"type":"room.join","roomId":"r1"}"#).await;
        assert_eq!(
            hub.room_members(&RoomId::from("r1")).await.unwrap(),
            vec![ConnectionId::from("c1")]
        );
        assert_eq!(next_json(&mut rx)["type"], "room.joined");

        handle_client_frame(&hub, &conn, r#"{"type":"room.leave","roomId":"r1"}"#).await;
        assert!(hub.room_members(&RoomId::from("r1")).await.unwrap().is_empty());
        assert_eq!(next_json(&mut rx)["type"], "room.left");
    }

    #[tokio::test]
    async fn typing_relays_to_others_in_room() {
        let hub = Hub::new(10);
        let (alice, mut rx_alice) = attach(&hub, ConnectionIdentity::new("a", "alice"));
        let (bob, mut rx_bob) = attach(&hub, ConnectionIdentity::new("b", "bob"));
        for conn in [&alice, &bob] {
            handle_client_frame(&hub, conn, r#"{"type":"room.join","roomId":"r1"}"#).await;
        }
        let _ = next_json(&mut rx_alice);
        let _ = next_json(&mut rx_bob);

        handle_client_frame(
            &hub,
            &alice,
            r#"{"type":"typing","conversationId":"r1","isTyping":true}"#,
        )
        .await;

        let relayed = next_json(&mut rx_bob);
        assert_eq!(relayed["type"], "typing");
        assert_eq!(relayed["userId"], "alice");
        assert_eq!(relayed["isTyping"], true);
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn garbage_frame_is_ignored() {
        let hub = Hub::new(10);
        let (conn, mut rx) = attach(&hub, ConnectionIdentity::anonymous("c1"));
        handle_client_frame(&hub, &conn, "not json").await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.room_count(), 0);
    }
}
