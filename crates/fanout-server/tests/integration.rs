//! End-to-end tests using real WebSocket clients against a live server.

use std::sync::Arc;
use std::time::Duration;

use fanout_core::{RealtimeEvent, RealtimeInstance, RoomId, UserId};
use fanout_server::FanoutServer;
use fanout_settings::FanoutSettings;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    server: Arc<FanoutServer>,
    ws_url: String,
    http_url: String,
    handles: Vec<JoinHandle<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.server.drain(self.handles).await;
    }
}

/// Boot a server on an ephemeral port.
async fn boot(pool_size: Option<usize>) -> TestServer {
    let mut settings = FanoutSettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    if let Some(size) = pool_size {
        settings.pool.enabled = true;
        settings.pool.initial_instances = size;
    }
    let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
    let server = Arc::new(FanoutServer::new(settings, metrics_handle).unwrap());

    let mut handles = server.start();
    let (addr, handle) = server.listen().await.unwrap();
    handles.push(handle);

    TestServer {
        server,
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
        handles,
    }
}

async fn connect(url: &str, connection_id: &str, user_id: Option<&str>) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("x-connection-id", connection_id.parse().unwrap());
    if let Some(user) = user_id {
        let _ = request.headers_mut().insert("x-user-id", user.parse().unwrap());
    }
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a message of the given type arrives.
async fn read_type(ws: &mut WsStream, event_type: &str) -> Value {
    loop {
        let msg = read_json(ws).await;
        if msg["type"] == event_type {
            return msg;
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn join(ws: &mut WsStream, room: &str) {
    send_json(ws, json!({"type": "room.join", "roomId": room})).await;
    let ack = read_type(ws, "room.joined").await;
    assert_eq!(ack["roomId"], room);
}

/// Poll until `check` passes or the timeout elapses.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_connection_established_on_connect() {
    let server = boot(None).await;
    let mut ws = connect(&server.ws_url, "conn-1", Some("alice")).await;

    let msg = read_json(&mut ws).await;
    assert_eq!(msg["type"], "connection.established");
    assert_eq!(msg["connectionId"], "conn-1");
    assert!(msg.get("nodeId").is_none());

    server.stop().await;
}

#[tokio::test]
async fn e2e_room_broadcast_with_exclude() {
    let server = boot(None).await;
    let mut alice = connect(&server.ws_url, "a", Some("alice")).await;
    let mut bob = connect(&server.ws_url, "b", Some("bob")).await;
    let _ = read_json(&mut alice).await;
    let _ = read_json(&mut bob).await;
    join(&mut alice, "conv-1").await;
    join(&mut bob, "conv-1").await;

    let event = RealtimeEvent::MessageNew {
        conversation_id: RoomId::from("conv-1"),
        message_id: "m1".into(),
        sender_id: Some(UserId::from("alice")),
        content: json!({"text": "hello"}),
    };
    let report = server
        .server
        .service()
        .broadcast_to_conversation(
            &RoomId::from("conv-1"),
            &event,
            Some(&"a".into()),
        )
        .await;
    assert_eq!(report.recipients, 1);

    let got = read_type(&mut bob, "message.new").await;
    assert_eq!(got["messageId"], "m1");
    assert_eq!(got["content"]["text"], "hello");

    // Alice was excluded: the next thing she sees is the broadcast to all.
    let _ = server
        .server
        .service()
        .broadcast_to_all(&RealtimeEvent::custom("ping", json!({})))
        .await;
    let next = read_json(&mut alice).await;
    assert_eq!(next["type"], "custom");

    server.stop().await;
}

#[tokio::test]
async fn e2e_typing_relayed_to_room() {
    let server = boot(None).await;
    let mut alice = connect(&server.ws_url, "a", Some("alice")).await;
    let mut bob = connect(&server.ws_url, "b", Some("bob")).await;
    let _ = read_json(&mut alice).await;
    let _ = read_json(&mut bob).await;
    join(&mut alice, "conv").await;
    join(&mut bob, "conv").await;

    send_json(
        &mut alice,
        json!({"type": "typing", "conversationId": "conv", "isTyping": true}),
    )
    .await;
    let typing = read_type(&mut bob, "typing").await;
    assert_eq!(typing["userId"], "alice");
    assert_eq!(typing["isTyping"], true);

    server.stop().await;
}

#[tokio::test]
async fn e2e_presence_follows_connections() {
    let server = boot(None).await;
    let service = Arc::clone(server.server.service());
    let alice = UserId::from("alice");

    let mut phone = connect(&server.ws_url, "phone", Some("alice")).await;
    let mut laptop = connect(&server.ws_url, "laptop", Some("alice")).await;
    let _ = read_json(&mut phone).await;
    let _ = read_json(&mut laptop).await;
    eventually(|| service.get_user_socket_count(&alice) == 2).await;

    let report = service
        .broadcast_to_user(&alice, &RealtimeEvent::custom("dm", json!({"n": 1})))
        .await;
    assert_eq!(report.recipients, 2);
    assert_eq!(read_json(&mut phone).await["event"], "dm");
    assert_eq!(read_json(&mut laptop).await["event"], "dm");

    phone.close(None).await.unwrap();
    laptop.close(None).await.unwrap();
    eventually(|| !service.is_user_connected(&alice)).await;

    server.stop().await;
}

#[tokio::test]
async fn e2e_message_stream_in_order() {
    let server = boot(None).await;
    let service = Arc::clone(server.server.service());
    let mut ws = connect(&server.ws_url, "reader", None).await;
    let _ = read_json(&mut ws).await;
    join(&mut ws, "conv").await;

    let room = RoomId::from("conv");
    let _ = service.start_message_stream(&room, "m1").await;
    assert!(service.stream_message_content(&room, "m1", "Hel", false).await);
    assert!(service.stream_message_content(&room, "m1", "lo", true).await);

    assert_eq!(read_json(&mut ws).await["type"], "message.stream_start");
    let first = read_json(&mut ws).await;
    assert_eq!(first["chunk"], "Hel");
    assert_eq!(first["isComplete"], false);
    let second = read_json(&mut ws).await;
    assert_eq!(second["isComplete"], true);
    let end = read_json(&mut ws).await;
    assert_eq!(end["type"], "message.stream_end");
    assert_eq!(end["totalChunks"], 2);
    assert_eq!(end["isComplete"], true);

    server.stop().await;
}

#[tokio::test]
async fn e2e_pool_spreads_and_fans_out() {
    let server = boot(Some(2)).await;
    let mut first = connect(&server.ws_url, "c1", None).await;
    let mut second = connect(&server.ws_url, "c2", None).await;

    let node_a = read_json(&mut first).await["nodeId"].clone();
    let node_b = read_json(&mut second).await["nodeId"].clone();
    assert!(node_a.is_string() && node_b.is_string());
    assert_ne!(node_a, node_b, "round-robin should spread two clients");

    let report = server
        .server
        .service()
        .broadcast_to_all(&RealtimeEvent::custom("news", json!({})))
        .await;
    assert_eq!(report.attempted, 2);
    assert!(report.is_complete());
    assert_eq!(read_json(&mut first).await["event"], "news");
    assert_eq!(read_json(&mut second).await["event"], "news");

    server.stop().await;
}

#[tokio::test]
async fn e2e_removed_instance_tells_clients_to_reconnect() {
    let server = boot(Some(1)).await;
    let mut ws = connect(&server.ws_url, "c1", None).await;
    let established = read_json(&mut ws).await;
    let node_id = established["nodeId"].as_str().unwrap().to_owned();

    assert!(server.server.remove_hub(&node_id.as_str().into()).await);

    let notice = read_type(&mut ws, "server.maintenance").await;
    assert_eq!(notice["reconnect"], true);
    let closed = timeout(TIMEOUT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    server.stop().await;
}

#[tokio::test]
async fn e2e_http_endpoints() {
    let server = boot(Some(2)).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", server.http_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["pool"]["totalInstances"], 2);

    let stats = client
        .get(format!("{}/stats", server.http_url))
        .send()
        .await
        .unwrap();
    assert_eq!(stats.status(), 200);
    let stats: Value = stats.json().await.unwrap();
    assert_eq!(stats["healthyNodes"], 2);

    let metrics = client
        .get(format!("{}/metrics", server.http_url))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);

    server.stop().await;
}

#[tokio::test]
async fn e2e_no_healthy_instance_rejects_upgrade() {
    let server = boot(Some(1)).await;
    let pool = server.server.service().pool().unwrap();
    let node = pool.instance_ids().remove(0);
    // A closed hub fails every later probe, so the node stays out.
    server.server.hub(Some(&node)).unwrap().shutdown().await;
    pool.balancer()
        .mark_unhealthy(&node, fanout_balancer::HealthReason::ProbeFailed);

    let request = server.ws_url.as_str().into_client_request().unwrap();
    assert!(connect_async(request).await.is_err());

    server.stop().await;
}
