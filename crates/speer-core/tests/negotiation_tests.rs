//! Negotiation tests over an in-process relay stand-in.
//!
//! `LoopbackRelay` applies the relay's forwarding rules (sender stamping,
//! friendship check, silent drop for unknown recipients) without a server,
//! so these tests exercise the negotiator and the sub-protocols end to end
//! on in-memory channels.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use speer_core::client::FrameHandler;
use speer_core::connection::{
    CallHandler, CallOutcome, CallRequest, Connection, DeliveryMode, FileConfig, FileDelivery,
    FileHandler, FilePayload, FileRequest, MediaStream, MessageHandler, SendOutcome,
};
use speer_core::negotiator::{ConnectionAcceptor, Negotiator, NegotiatorConfig, SignalSink};
use speer_core::protocol::{ErrorFrame, ForwardedSignal, ServerFrame, SignalFrame, NOT_FRIEND};
use speer_core::transport::MemoryNetwork;
use speer_core::{Error, Identity, Result};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct LoopbackRelay {
    endpoints: Mutex<HashMap<Identity, Negotiator>>,
    friendships: HashSet<(String, String)>,
    deaf: bool,
}

impl LoopbackRelay {
    fn with_friends(pairs: &[(&str, &str)]) -> Arc<Self> {
        let mut friendships = HashSet::new();
        for (a, b) in pairs {
            friendships.insert((a.to_string(), b.to_string()));
            friendships.insert((b.to_string(), a.to_string()));
        }
        Arc::new(Self {
            friendships,
            ..Self::default()
        })
    }

    fn deaf() -> Arc<Self> {
        Arc::new(Self {
            deaf: true,
            ..Self::default()
        })
    }

    fn endpoint(&self, identity: &Identity) -> Option<Negotiator> {
        self.endpoints.lock().unwrap().get(identity).cloned()
    }
}

struct RelayLink {
    relay: Arc<LoopbackRelay>,
    local: Identity,
}

#[async_trait]
impl SignalSink for RelayLink {
    async fn send_signal(&self, frame: SignalFrame) -> Result<()> {
        if self.relay.deaf {
            return Ok(());
        }
        let Some(target) = self.relay.endpoint(&frame.remote_id) else {
            return Ok(());
        };
        let pair = (self.local.to_string(), frame.remote_id.to_string());
        if !self.relay.friendships.contains(&pair) {
            if let Some(sender) = self.relay.endpoint(&self.local) {
                let error = ErrorFrame {
                    error: NOT_FRIEND.to_string(),
                    remote_id: Some(frame.remote_id),
                };
                sender.handle_frame(ServerFrame::Error(error)).await;
            }
            return Ok(());
        }
        let forwarded = ForwardedSignal::from_sender(self.local.clone(), frame);
        target.handle_frame(ServerFrame::Signal(forwarded)).await;
        Ok(())
    }
}

#[derive(Debug)]
enum Event {
    Message(Value),
    File(FileDelivery),
    Call(String),
    Closed,
}

#[derive(Clone)]
struct Inbox(mpsc::UnboundedSender<Event>);

impl MessageHandler for Inbox {
    fn on_data(&self, _remote: &Identity, data: Value) {
        let _ = self.0.send(Event::Message(data));
    }
    fn on_close(&self, _remote: &Identity) {
        let _ = self.0.send(Event::Closed);
    }
}

impl FileHandler for Inbox {
    fn on_request(&self, _remote: &Identity, request: FileRequest) {
        request.accept_quietly();
    }
    fn on_receive(&self, _remote: &Identity, delivery: FileDelivery) {
        let _ = self.0.send(Event::File(delivery));
    }
    fn on_close(&self, _remote: &Identity) {
        let _ = self.0.send(Event::Closed);
    }
}

impl CallHandler for Inbox {
    fn on_request(&self, _remote: &Identity, request: CallRequest) {
        let _ = self.0.send(Event::Call("request".into()));
        request.accept(MediaStream::new("answer"));
    }
    fn on_end(&self, _remote: &Identity) {
        let _ = self.0.send(Event::Call("end".into()));
    }
    fn on_close(&self, _remote: &Identity) {
        let _ = self.0.send(Event::Closed);
    }
}

struct Acceptor {
    inbox: Inbox,
    connections: mpsc::UnboundedSender<Connection>,
}

impl ConnectionAcceptor for Acceptor {
    fn message_handler(&self, _remote: &Identity) -> Arc<dyn MessageHandler> {
        Arc::new(self.inbox.clone())
    }
    fn file_handler(&self, _remote: &Identity) -> Arc<dyn FileHandler> {
        Arc::new(self.inbox.clone())
    }
    fn file_config(&self, _remote: &Identity) -> FileConfig {
        FileConfig {
            mode: DeliveryMode::Accumulate,
            ..FileConfig::default()
        }
    }
    fn call_handler(&self, _remote: &Identity) -> Arc<dyn CallHandler> {
        Arc::new(self.inbox.clone())
    }
    fn on_connection(&self, connection: Connection) {
        let _ = self.connections.send(connection);
    }
}

struct Client {
    negotiator: Negotiator,
    events: mpsc::UnboundedReceiver<Event>,
    connections: mpsc::UnboundedReceiver<Connection>,
    inbox: Inbox,
}

fn join(relay: &Arc<LoopbackRelay>, network: &MemoryNetwork, name: &str, config: NegotiatorConfig) -> Client {
    let identity = Identity::from(name);
    let (event_tx, events) = mpsc::unbounded_channel();
    let (conn_tx, connections) = mpsc::unbounded_channel();
    let inbox = Inbox(event_tx);
    let negotiator = Negotiator::new(
        Arc::new(network.factory(identity.clone())),
        Arc::new(RelayLink {
            relay: Arc::clone(relay),
            local: identity.clone(),
        }),
        Arc::new(Acceptor {
            inbox: inbox.clone(),
            connections: conn_tx,
        }),
        config,
    );
    relay
        .endpoints
        .lock()
        .unwrap()
        .insert(identity, negotiator.clone());
    Client {
        negotiator,
        events,
        connections,
        inbox,
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("should receive within timeout")
        .expect("sender alive")
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test]
async fn test_friends_negotiate_basic_connection() {
    let relay = LoopbackRelay::with_friends(&[("alice", "bob")]);
    let network = MemoryNetwork::new();
    let alice = join(&relay, &network, "alice", NegotiatorConfig::default());
    let mut bob = join(&relay, &network, "bob", NegotiatorConfig::default());

    let connection = alice
        .negotiator
        .create_connection(&Identity::from("bob"), Arc::new(alice.inbox.clone()))
        .await
        .expect("negotiation should succeed");

    let incoming = next(&mut bob.connections).await;
    assert_eq!(incoming.remote().as_str(), "alice");
    assert!(matches!(incoming, Connection::Message(_)));

    connection.send(json!("hi")).await.unwrap();
    match next(&mut bob.events).await {
        Event::Message(data) => assert_eq!(data, json!("hi")),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(alice.negotiator.pending_count(), 0);
    assert_eq!(bob.negotiator.pending_count(), 0);
    assert_eq!(network.pending_offers(), 0);
}

#[tokio::test]
async fn test_non_friend_is_refused() {
    let relay = LoopbackRelay::with_friends(&[]);
    let network = MemoryNetwork::new();
    let alice = join(&relay, &network, "alice", NegotiatorConfig::default());
    let mut carol = join(&relay, &network, "carol", NegotiatorConfig::default());

    let result = alice
        .negotiator
        .create_connection(&Identity::from("carol"), Arc::new(alice.inbox.clone()))
        .await;

    match result {
        Err(Error::AuthorizationDenied(reason)) => assert_eq!(reason, NOT_FRIEND),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("negotiation should be refused"),
    }
    assert!(carol.connections.try_recv().is_err());
    assert_eq!(alice.negotiator.pending_count(), 0);
}

#[tokio::test]
async fn test_negotiation_times_out_and_frees_slot() {
    let relay = LoopbackRelay::deaf();
    let network = MemoryNetwork::new();
    let config = NegotiatorConfig {
        negotiation_timeout: Duration::from_millis(100),
    };
    let alice = join(&relay, &network, "alice", config);
    let bob = Identity::from("bob");

    for _ in 0..2 {
        let result = alice
            .negotiator
            .create_connection(&bob, Arc::new(alice.inbox.clone()))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
    assert_eq!(alice.negotiator.pending_count(), 0);
}

#[tokio::test]
async fn test_one_negotiation_per_remote() {
    let relay = LoopbackRelay::deaf();
    let network = MemoryNetwork::new();
    let alice = join(&relay, &network, "alice", NegotiatorConfig::default());

    let first = {
        let negotiator = alice.negotiator.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(alice.inbox.clone());
        tokio::spawn(async move { negotiator.create_connection(&Identity::from("bob"), handler).await })
    };
    while alice.negotiator.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = alice
        .negotiator
        .create_connection(&Identity::from("bob"), Arc::new(alice.inbox.clone()))
        .await;
    assert!(matches!(second, Err(Error::NegotiationInProgress)));

    // Losing the relay rejects what is still pending.
    alice.negotiator.on_close().await;
    assert!(matches!(first.await.unwrap(), Err(Error::ChannelClosed)));
}

// ============================================================================
// Sub-protocols over negotiated channels
// ============================================================================

#[tokio::test]
async fn test_file_connection_end_to_end() {
    let relay = LoopbackRelay::with_friends(&[("alice", "bob")]);
    let network = MemoryNetwork::new();
    let alice = join(&relay, &network, "alice", NegotiatorConfig::default());
    let mut bob = join(&relay, &network, "bob", NegotiatorConfig::default());

    let connection = alice
        .negotiator
        .create_file_connection(
            &Identity::from("bob"),
            Arc::new(alice.inbox.clone()),
            FileConfig::default(),
        )
        .await
        .unwrap();
    assert!(matches!(next(&mut bob.connections).await, Connection::File(_)));

    let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let outcome = connection
        .send(FilePayload::new("notes.bin", "application/octet-stream", data.clone()), None)
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    match next(&mut bob.events).await {
        Event::File(FileDelivery::File(file)) => {
            assert_eq!(file.metadata.name, "notes.bin");
            assert_eq!(file.metadata.chunk_count, 3);
            assert_eq!(file.data, data);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_call_connection_end_to_end() {
    let relay = LoopbackRelay::with_friends(&[("alice", "bob")]);
    let network = MemoryNetwork::new();
    let alice = join(&relay, &network, "alice", NegotiatorConfig::default());
    let mut bob = join(&relay, &network, "bob", NegotiatorConfig::default());

    let call = alice
        .negotiator
        .create_call_connection(&Identity::from("bob"), Arc::new(alice.inbox.clone()))
        .await
        .unwrap();
    let incoming = next(&mut bob.connections).await;
    assert_eq!(incoming.sub_protocol().as_str(), "call");

    let outcome = call.call(MediaStream::new("offer"), json!({"audio": true})).await.unwrap();
    assert_eq!(outcome, CallOutcome::Accepted);
    assert!(matches!(next(&mut bob.events).await, Event::Call(kind) if kind == "request"));

    call.end().await;
    assert!(matches!(next(&mut bob.events).await, Event::Call(kind) if kind == "end"));

    incoming.close().await;
    assert!(matches!(next(&mut bob.events).await, Event::Closed));
}
