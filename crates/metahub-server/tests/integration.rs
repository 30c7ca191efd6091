//! End-to-end tests against a real server with WebSocket clients.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metahub_server::{HubServer, ServerConfig};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a server on an ephemeral port. Returns the base `host:port`.
async fn boot_server() -> (String, HubServer) {
    boot_server_with(ServerConfig::default()).await
}

async fn boot_server_with(config: ServerConfig) -> (String, HubServer) {
    let server = HubServer::new(config);
    let (addr, _handle) = server.listen().await.unwrap();
    (addr.to_string(), server)
}

async fn connect(base: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{base}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON.
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

/// Assert that no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let got = timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = got {
        panic!("unexpected frame: {text}");
    }
}

/// Wait until the server closes the socket.
async fn wait_closed(ws: &mut WsStream) {
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket was not closed");
}

fn frame(msg_type: &str, sender: Value, recipient: Value, payload: Value) -> Value {
    json!({"type": msg_type, "sender": sender, "recipient": recipient, "payload": payload})
}

fn who(role: &str, id: &str) -> Value {
    json!({"type": role, "id": id})
}

async fn join(base: &str, role: &str, id: &str) -> WsStream {
    let mut ws = connect(base).await;
    send(&mut ws, frame("join", who(role, id), json!({"type": "hub"}), json!({}))).await;
    let ack = read_json(&mut ws).await;
    assert_eq!(ack["payload"]["status"], "registered", "join failed: {ack}");
    ws
}

async fn bind(ws: &mut WsStream, role: &str, id: &str, env_id: &str) {
    send(ws, frame("bind", who(role, id), who("env", env_id), json!({}))).await;
    let ack = read_json(ws).await;
    assert_eq!(ack["payload"], json!({"status": "bound", "env_id": env_id}), "bind failed: {ack}");
}

#[tokio::test]
async fn e2e_bound_action_reaches_env_unchanged() {
    let (base, server) = boot_server().await;
    let mut env = join(&base, "env", "e1").await;
    let mut agent = join(&base, "agent", "a1").await;
    bind(&mut agent, "agent", "a1", "e1").await;
    assert_eq!(read_json(&mut env).await["type"], "bind");

    let payload = json!({"move": "north", "speed": 2});
    send(&mut agent, frame("action", who("agent", "a1"), who("env", "e1"), payload.clone())).await;

    let got = read_json(&mut env).await;
    assert_eq!(got["type"], "action");
    assert_eq!(got["sender"], who("agent", "a1"));
    assert_eq!(got["payload"], payload);
    assert_silent(&mut agent).await;

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_unbound_action_is_reported_and_connection_survives() {
    let (base, server) = boot_server().await;
    let mut env = join(&base, "env", "e1").await;
    let mut agent = join(&base, "agent", "a1").await;

    send(&mut agent, frame("action", who("agent", "a1"), who("env", "e1"), json!({}))).await;
    let err = read_json(&mut agent).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["sender"], json!({"type": "hub"}));
    assert!(err["payload"]["error"].as_str().unwrap().contains("not bound"));
    assert_silent(&mut env).await;

    bind(&mut agent, "agent", "a1", "e1").await;

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_action_to_other_env_is_routing_error() {
    let (base, server) = boot_server().await;
    let _e1 = join(&base, "env", "e1").await;
    let mut e2 = join(&base, "env", "e2").await;
    let mut agent = join(&base, "agent", "a1").await;
    bind(&mut agent, "agent", "a1", "e1").await;

    send(&mut agent, frame("action", who("agent", "a1"), who("env", "e2"), json!({}))).await;
    let err = read_json(&mut agent).await;
    assert_eq!(err["payload"]["code"], "ROUTING_ERROR");
    assert_eq!(err["payload"]["details"], json!({"requested": "e2", "bound": "e1"}));
    assert_silent(&mut e2).await;

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_bind_to_unknown_env_fails() {
    let (base, server) = boot_server().await;
    let mut human = join(&base, "human", "h1").await;
    send(&mut human, frame("bind", who("human", "h1"), who("env", "E1"), json!({}))).await;
    let err = read_json(&mut human).await;
    assert_eq!(err["payload"]["code"], "BINDING_ERROR");
    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_state_fans_out_to_bound_members() {
    let (base, server) = boot_server().await;
    let mut env = join(&base, "env", "e1").await;
    let mut members = Vec::new();
    for (role, id) in [("agent", "a1"), ("agent", "a2"), ("human", "h1")] {
        let mut ws = join(&base, role, id).await;
        bind(&mut ws, role, id, "e1").await;
        read_json(&mut env).await;
        members.push(ws);
    }
    let mut outsider = join(&base, "agent", "a9").await;

    send(&mut env, frame("state", who("env", "e1"), json!({"type": "hub"}), json!({"tick": 7}))).await;
    for ws in &mut members {
        let got = read_json(ws).await;
        assert_eq!(got["type"], "state");
        assert_eq!(got["payload"]["tick"], 7);
    }
    assert_silent(&mut outsider).await;
    assert_silent(&mut env).await;

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_env_disconnect_cascades_to_members() {
    let (base, server) = boot_server().await;
    let mut env = join(&base, "env", "e1").await;
    let mut agent = join(&base, "agent", "a1").await;
    bind(&mut agent, "agent", "a1", "e1").await;
    read_json(&mut env).await;

    env.close(None).await.unwrap();

    let notice = read_json(&mut agent).await;
    assert_eq!(notice["type"], "leave");
    assert_eq!(notice["payload"]["env_id"], "e1");

    // still connected, no longer bound
    send(&mut agent, frame("action", who("agent", "a1"), who("env", "e1"), json!({}))).await;
    let err = read_json(&mut agent).await;
    assert!(err["payload"]["error"].as_str().unwrap().contains("not bound"));
    assert!(server.hub().lookup(&metahub_core::Identity::agent("a1")).is_some());

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_invalid_recipient_shape_is_validation_error() {
    let (base, server) = boot_server().await;
    let mut agent = join(&base, "agent", "a1").await;
    send(
        &mut agent,
        json!({"type": "direct_message", "sender": who("agent", "a1"), "recipient": "e1", "payload": {}}),
    )
    .await;
    let err = read_json(&mut agent).await;
    assert_eq!(err["payload"]["code"], "VALIDATION_ERROR");
    let text = err["payload"]["error"].as_str().unwrap();
    assert!(text.contains("recipient"), "{text}");
    assert!(text.contains("string"), "{text}");
    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_invalid_role_lists_valid_roles() {
    let (base, server) = boot_server().await;
    let mut ws = connect(&base).await;
    send(&mut ws, frame("join", who("robot", "r1"), json!({"type": "hub"}), json!({}))).await;
    let err = read_json(&mut ws).await;
    assert_eq!(err["payload"]["details"]["valid_roles"], json!(["hub", "env", "agent", "human"]));
    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_direct_message_between_members() {
    let (base, server) = boot_server().await;
    let mut a1 = join(&base, "agent", "a1").await;
    let mut h1 = join(&base, "human", "h1").await;

    send(&mut a1, frame("direct_message", who("agent", "a1"), who("human", "h1"), json!({"text": "hi"}))).await;
    assert_eq!(read_json(&mut h1).await["payload"]["text"], "hi");

    send(&mut a1, frame("direct_message", who("agent", "a1"), who("human", "ghost"), json!({}))).await;
    let err = read_json(&mut a1).await;
    assert_eq!(err["payload"]["details"]["available"], json!(["h1"]));

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_reconnect_replaces_connection() {
    let (base, server) = boot_server().await;
    let _env = join(&base, "env", "e1").await;
    let mut first = join(&base, "agent", "a1").await;
    bind(&mut first, "agent", "a1", "e1").await;

    let mut second = connect(&base).await;
    send(&mut second, frame("join", who("agent", "a1"), json!({"type": "hub"}), json!({}))).await;
    assert_eq!(read_json(&mut second).await["payload"]["replaced"], true);

    // the old socket is closed by the hub
    wait_closed(&mut first).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let hub = server.hub();
    assert!(hub.lookup(&metahub_core::Identity::agent("a1")).is_some());
    assert_eq!(hub.env_of(&metahub_core::Identity::agent("a1")).as_deref(), Some("e1"));

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_leave_unregisters() {
    let (base, server) = boot_server().await;
    let mut agent = join(&base, "agent", "a1").await;
    send(&mut agent, frame("leave", who("agent", "a1"), json!({"type": "hub"}), json!({}))).await;
    assert_eq!(read_json(&mut agent).await["payload"]["status"], "left");
    wait_closed(&mut agent).await;
    assert!(server.hub().lookup(&metahub_core::Identity::agent("a1")).is_none());
    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_ping_pong_and_status() {
    let (base, server) = boot_server().await;
    let mut ws = connect(&base).await;
    send(
        &mut ws,
        json!({"type": "ping", "sender": who("human", "h1"), "recipient": {"type": "hub"}, "timestamp": "t0"}),
    )
    .await;
    let pong = read_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["payload"]["timestamp"], "t0");

    send(&mut ws, frame("join", who("human", "h1"), json!({"type": "hub"}), json!({}))).await;
    read_json(&mut ws).await;
    send(&mut ws, frame("status", who("human", "h1"), json!({"type": "hub"}), json!({}))).await;
    let status = read_json(&mut ws).await;
    assert_eq!(status["payload"]["clients"]["human"], json!(["h1"]));

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_admin_endpoints() {
    let (base, server) = boot_server().await;
    let _env = join(&base, "env", "e1").await;
    let mut agent = join(&base, "agent", "a1").await;
    bind(&mut agent, "agent", "a1", "e1").await;

    let health: Value = reqwest::get(format!("http://{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 2);

    let clients: Value = reqwest::get(format!("http://{base}/clients?role=env"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients["ids"], json!(["e1"]));

    let bad = reqwest::get(format!("http://{base}/clients?role=robot")).await.unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

    let bindings: Value = reqwest::get(format!("http://{base}/bindings"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bindings["e1"], json!([{"type": "agent", "id": "a1"}]));

    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_connection_limit_rejects_upgrade() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (base, server) = boot_server_with(config).await;
    let _first = join(&base, "agent", "a1").await;
    assert!(connect_async(format!("ws://{base}/ws")).await.is_err());
    server.shutdown().shutdown();
}

#[tokio::test]
async fn e2e_graceful_shutdown_closes_sessions() {
    let (base, server) = boot_server().await;
    let mut agent = join(&base, "agent", "a1").await;

    assert!(server.shutdown().graceful_shutdown(Some(TIMEOUT)).await);
    wait_closed(&mut agent).await;
    assert!(server.hub().lookup(&metahub_core::Identity::agent("a1")).is_none());
}
