//! Integration tests for the relay server.
//!
//! Tests cover:
//! - Cookie authentication before the websocket upgrade
//! - Signal forwarding between friends, refusal between strangers
//! - Displacement of an identity's previous socket
//! - Presence events on the hub
//! - Presence queries over HTTP
//! - A full negotiation between two clients through the relay

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use speer_core::client::RelayClient;
use speer_core::connection::{
    CallHandler, CallRequest, Connection, FileDelivery, FileHandler, FileRequest, MessageHandler,
};
use speer_core::negotiator::{ConnectionAcceptor, Negotiator, NegotiatorConfig};
use speer_core::transport::MemoryNetwork;
use speer_core::Identity;
use speer_relay::auth::StaticDirectory;
use speer_relay::{router, AppState, RelayConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DIRECTORY: &str = r#"{
    "sessions": {"s-alice": "alice", "s-bob": "bob", "s-carol": "carol"},
    "friendships": [["alice", "bob"]]
}"#;

// ========================================
// Test Helpers
// ========================================

/// Start a relay on a random port and return its address and state.
async fn start_test_server() -> (SocketAddr, Arc<AppState>) {
    let directory = Arc::new(StaticDirectory::from_json(DIRECTORY).expect("valid directory"));
    let config = RelayConfig::default();
    let state = AppState::new(&config, directory.clone(), directory);
    let app = router(Arc::clone(&state), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Connect a websocket presenting `session` as cookie.
async fn ws_connect(addr: SocketAddr, path: &str, session: &str) -> WsStream {
    let mut request = format!("ws://{}{}", addr, path)
        .into_client_request()
        .expect("valid request");
    request.headers_mut().insert(
        "cookie",
        HeaderValue::from_str(&format!("speer={}", session)).unwrap(),
    );
    let (stream, _response) = connect_async(request)
        .await
        .expect("WebSocket connect should succeed");
    stream
}

/// Read the next text message, parsed as JSON.
async fn read_ws_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("should receive message within timeout")
            .expect("stream should not end")
            .expect("message should be ok");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("should be valid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text message, got: {:?}", other),
        }
    }
}

/// Assert that nothing arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

/// Wait until `identity` is registered with the relay.
async fn wait_online(state: &AppState, identity: &str) {
    let identity = Identity::from(identity);
    for _ in 0..100 {
        if state.relay.registry().is_online(&identity).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never came online", identity);
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send frame");
}

/// Minimal HTTP GET returning (status line, body).
async fn http_get(addr: SocketAddr, path: &str, session: Option<&str>) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let cookie = session
        .map(|s| format!("Cookie: speer={}\r\n", s))
        .unwrap_or_default();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}Connection: close\r\n\r\n",
        path, addr, cookie
    );
    stream.write_all(request.as_bytes()).await.expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read response");
    let status = response.lines().next().unwrap_or_default().to_string();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

// ========================================
// Authentication
// ========================================

#[tokio::test]
async fn test_upgrade_requires_session() {
    let (addr, state) = start_test_server().await;

    let result = connect_async(format!("ws://{}/signal", addr)).await;
    assert!(result.is_err(), "upgrade without cookie should fail");

    let mut request = format!("ws://{}/signal", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("cookie", HeaderValue::from_static("speer=forged"));
    assert!(connect_async(request).await.is_err());

    match RelayClient::connect(&format!("ws://{}/pusher", addr), "forged").await {
        Err(speer_core::Error::Unauthenticated) => {}
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("forged session should be refused"),
    }

    assert!(state.relay.registry().is_empty().await);
    assert!(state.hub.registry().is_empty().await);
}

// ========================================
// Signal forwarding
// ========================================

#[tokio::test]
async fn test_signal_forwarded_between_friends() {
    let (addr, state) = start_test_server().await;
    let mut alice = ws_connect(addr, "/signal", "s-alice").await;
    let mut bob = ws_connect(addr, "/signal", "s-bob").await;
    wait_online(&state, "bob").await;

    send_json(
        &mut alice,
        json!({"action": "signal", "remoteId": "bob", "type": "basic", "peerData": {"token": "t1"}}),
    )
    .await;

    let forwarded = read_ws_json(&mut bob).await;
    assert_eq!(
        forwarded,
        json!({"action": "signal", "remoteId": "alice", "type": "basic", "peerData": {"token": "t1"}, "data": null})
    );
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_signal_to_stranger_refused() {
    let (addr, state) = start_test_server().await;
    let mut alice = ws_connect(addr, "/signal", "s-alice").await;
    let mut carol = ws_connect(addr, "/signal", "s-carol").await;
    wait_online(&state, "carol").await;

    send_json(
        &mut alice,
        json!({"action": "signal", "remoteId": "carol", "type": "binary", "peerData": {}}),
    )
    .await;

    assert_eq!(
        read_ws_json(&mut alice).await,
        json!({"error": "Not friend", "remoteId": "carol"})
    );
    assert_silent(&mut carol).await;
}

#[tokio::test]
async fn test_reconnect_displaces_previous_socket() {
    let (addr, state) = start_test_server().await;
    let mut first = ws_connect(addr, "/signal", "s-bob").await;
    wait_online(&state, "bob").await;
    let mut second = ws_connect(addr, "/signal", "s-bob").await;

    // The first socket is closed by the relay.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = first.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "displaced socket should close");

    let mut alice = ws_connect(addr, "/signal", "s-alice").await;
    wait_online(&state, "alice").await;
    send_json(
        &mut alice,
        json!({"action": "signal", "remoteId": "bob", "type": "call", "peerData": "offer"}),
    )
    .await;
    assert_eq!(read_ws_json(&mut second).await["peerData"], "offer");
    assert_eq!(state.relay.registry().len().await, 2);
}

// ========================================
// Presence
// ========================================

#[tokio::test]
async fn test_friends_receive_login_and_logout() {
    let (addr, state) = start_test_server().await;
    let mut bob_hub = ws_connect(addr, "/pusher", "s-bob").await;
    send_json(&mut bob_hub, json!({"action": "subscribe", "event": "login"})).await;
    send_json(&mut bob_hub, json!({"action": "subscribe", "event": "logout"})).await;
    for _ in 0..100 {
        if state.hub.subscribers("logout").await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut carol_hub = ws_connect(addr, "/pusher", "s-carol").await;
    send_json(&mut carol_hub, json!({"action": "subscribe", "event": "login"})).await;

    let mut alice = ws_connect(addr, "/signal", "s-alice").await;
    assert_eq!(
        read_ws_json(&mut bob_hub).await,
        json!({"event": "login", "data": "alice"})
    );

    alice.send(Message::Close(None)).await.expect("close");
    assert_eq!(
        read_ws_json(&mut bob_hub).await,
        json!({"event": "logout", "data": "alice"})
    );
    assert_silent(&mut carol_hub).await;
}

#[tokio::test]
async fn test_presence_queries() {
    let (addr, state) = start_test_server().await;
    let _bob = ws_connect(addr, "/signal", "s-bob").await;
    wait_online(&state, "bob").await;

    let (status, body) = http_get(addr, "/onlines", Some("s-alice")).await;
    assert!(status.contains("200"), "status: {}", status);
    assert!(body.contains(r#"["bob"]"#), "body: {}", body);

    let (status, body) = http_get(addr, "/online/bob", Some("s-alice")).await;
    assert!(status.contains("200"), "status: {}", status);
    assert!(body.contains("true"), "body: {}", body);

    let (status, body) = http_get(addr, "/online/bob", Some("s-carol")).await;
    assert!(status.contains("403"), "status: {}", status);
    assert!(body.contains("Not friend"), "body: {}", body);

    let (status, _) = http_get(addr, "/onlines", None).await;
    assert!(status.contains("401"), "status: {}", status);
}

// ========================================
// End to end negotiation
// ========================================

struct Inbox(mpsc::UnboundedSender<Value>);

impl MessageHandler for Inbox {
    fn on_data(&self, _remote: &Identity, data: Value) {
        let _ = self.0.send(data);
    }
    fn on_close(&self, _remote: &Identity) {}
}

impl FileHandler for Inbox {
    fn on_request(&self, _remote: &Identity, request: FileRequest) {
        request.decline();
    }
    fn on_receive(&self, _remote: &Identity, _delivery: FileDelivery) {}
    fn on_close(&self, _remote: &Identity) {}
}

impl CallHandler for Inbox {
    fn on_request(&self, _remote: &Identity, request: CallRequest) {
        request.decline();
    }
    fn on_end(&self, _remote: &Identity) {}
    fn on_close(&self, _remote: &Identity) {}
}

/// Echoes every message received on an incoming connection.
struct EchoAcceptor {
    connections: mpsc::UnboundedSender<Connection>,
    messages: mpsc::UnboundedSender<Value>,
}

impl ConnectionAcceptor for EchoAcceptor {
    fn message_handler(&self, _remote: &Identity) -> Arc<dyn MessageHandler> {
        Arc::new(Inbox(self.messages.clone()))
    }
    fn file_handler(&self, _remote: &Identity) -> Arc<dyn FileHandler> {
        Arc::new(Inbox(self.messages.clone()))
    }
    fn call_handler(&self, _remote: &Identity) -> Arc<dyn CallHandler> {
        Arc::new(Inbox(self.messages.clone()))
    }
    fn on_connection(&self, connection: Connection) {
        let _ = self.connections.send(connection);
    }
}

async fn client(
    addr: SocketAddr,
    network: &MemoryNetwork,
    name: &str,
    session: &str,
) -> (
    Negotiator,
    mpsc::UnboundedReceiver<Connection>,
    mpsc::UnboundedReceiver<Value>,
) {
    let (relay, inbound) = RelayClient::connect(&format!("ws://{}/signal", addr), session)
        .await
        .expect("relay connect");
    let (conn_tx, connections) = mpsc::unbounded_channel();
    let (msg_tx, messages) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(
        Arc::new(network.factory(name)),
        relay,
        Arc::new(EchoAcceptor {
            connections: conn_tx,
            messages: msg_tx,
        }),
        NegotiatorConfig::default(),
    );
    tokio::spawn(inbound.run(Arc::new(negotiator.clone())));
    (negotiator, connections, messages)
}

#[tokio::test]
async fn test_negotiation_through_relay() {
    let (addr, state) = start_test_server().await;
    let network = MemoryNetwork::new();
    let (alice, _alice_connections, mut alice_messages) =
        client(addr, &network, "alice", "s-alice").await;
    let (_bob, mut bob_connections, mut bob_messages) = client(addr, &network, "bob", "s-bob").await;
    wait_online(&state, "bob").await;

    let (tx, _unused) = mpsc::unbounded_channel();
    let connection = alice
        .create_connection(&Identity::from("bob"), Arc::new(Inbox(tx)))
        .await
        .expect("negotiation should succeed");

    let incoming = tokio::time::timeout(Duration::from_secs(5), bob_connections.recv())
        .await
        .expect("bob should get a connection")
        .expect("acceptor alive");
    assert_eq!(incoming.remote().as_str(), "alice");

    connection.send(json!({"text": "hello bob"})).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), bob_messages.recv())
        .await
        .expect("bob should get the message")
        .expect("inbox alive");
    assert_eq!(received, json!({"text": "hello bob"}));
    assert!(alice_messages.try_recv().is_err());
}

#[tokio::test]
async fn test_negotiation_with_stranger_is_denied() {
    let (addr, state) = start_test_server().await;
    let network = MemoryNetwork::new();
    let (alice, _, _) = client(addr, &network, "alice", "s-alice").await;
    let (_carol, mut carol_connections, _) = client(addr, &network, "carol", "s-carol").await;
    wait_online(&state, "carol").await;

    let (tx, _unused) = mpsc::unbounded_channel();
    let result = alice
        .create_connection(&Identity::from("carol"), Arc::new(Inbox(tx)))
        .await;
    match result {
        Err(speer_core::Error::AuthorizationDenied(reason)) => assert_eq!(reason, "Not friend"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("stranger negotiation should fail"),
    }
    assert!(carol_connections.try_recv().is_err());
}
