//! Broadcast hub ("pusher").
//!
//! Topic publish/subscribe over the hub's own connection registry. Clients
//! send `{action:"subscribe"|"unsubscribe", event}`; the server side
//! dispatches `{event, data}` to the subscribers of a topic, optionally
//! restricted to a set of recipients and transformed per recipient.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use speer_core::protocol::{ClientFrame, EventFrame, ServerFrame};
use speer_core::{Identity, Result};

use crate::registry::{ConnectionRegistry, SocketId, SocketRef};

/// Per-recipient transformation of dispatched data.
#[async_trait]
pub trait PrepareData: Send + Sync {
    /// Data to deliver to `recipient`. An error skips that recipient only.
    async fn prepare(&self, recipient: &Identity, data: &Value) -> Result<Value>;
}

/// Topic subscriptions over a connection registry.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    subscriptions: RwLock<HashMap<String, Vec<(Identity, SocketId)>>>,
}

impl Hub {
    /// Create a hub serving the sockets of `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// The hub's connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Subscribe `socket` to `topic`. Only the identity's current socket may subscribe.
    pub async fn subscribe(&self, socket: &SocketRef, topic: &str) -> bool {
        let current = self.registry.lookup(&socket.identity).await;
        if current.map(|s| s.socket_id) != Some(socket.socket_id) {
            debug!(peer = %socket.identity.redacted(), "Subscribe from stale socket");
            return false;
        }

        let mut subscriptions = self.subscriptions.write().await;
        let subscribers = subscriptions.entry(topic.to_string()).or_default();
        let key = (socket.identity.clone(), socket.socket_id);
        if !subscribers.contains(&key) {
            subscribers.push(key);
        }
        debug!(peer = %socket.identity.redacted(), topic, "Subscribed");
        true
    }

    /// Remove `socket`'s subscription to `topic`.
    pub async fn unsubscribe(&self, socket: &SocketRef, topic: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(subscribers) = subscriptions.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(identity, id)| !(identity == &socket.identity && *id == socket.socket_id));
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            subscriptions.remove(topic);
        }
        removed
    }

    /// Drop every subscription held by `socket_id`.
    pub async fn prune(&self, socket_id: SocketId) {
        let mut subscriptions = self.subscriptions.write().await;
        for subscribers in subscriptions.values_mut() {
            subscribers.retain(|(_, id)| *id != socket_id);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Identities subscribed to `topic`, in subscription order.
    pub async fn subscribers(&self, topic: &str) -> Vec<Identity> {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map(|s| s.iter().map(|(identity, _)| identity.clone()).collect())
            .unwrap_or_default()
    }

    /// Send `{event: topic, data}` to the subscribers of `topic`.
    ///
    /// With `filter`, only subscribers listed in it receive the event. With
    /// `transform`, each recipient gets its own prepared data. Returns the
    /// number of sockets the event was queued on.
    pub async fn dispatch(
        &self,
        topic: &str,
        data: Value,
        filter: Option<&[Identity]>,
        transform: Option<&dyn PrepareData>,
    ) -> usize {
        let targets: Vec<(Identity, SocketId)> = {
            let subscriptions = self.subscriptions.read().await;
            let Some(subscribers) = subscriptions.get(topic) else {
                return 0;
            };
            subscribers
                .iter()
                .filter(|(identity, _)| filter.map_or(true, |f| f.contains(identity)))
                .cloned()
                .collect()
        };

        let data = &data;
        let deliveries = targets.into_iter().map(|(identity, socket_id)| async move {
            let prepared = match transform {
                Some(transform) => match transform.prepare(&identity, data).await {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        warn!(peer = %identity.redacted(), topic, error = %e, "Could not prepare event");
                        return false;
                    }
                },
                None => data.clone(),
            };
            match self.registry.lookup(&identity).await {
                Some(socket) if socket.socket_id == socket_id => {
                    socket.send_frame(&ServerFrame::Event(EventFrame {
                        event: topic.to_string(),
                        data: prepared,
                    }))
                }
                _ => false,
            }
        });

        let delivered = join_all(deliveries).await.into_iter().filter(|sent| *sent).count();
        debug!(topic, delivered, "Event dispatched");
        delivered
    }

    /// Handle a text frame from a hub socket.
    pub async fn handle_frame(&self, socket: &SocketRef, text: &str) {
        match ClientFrame::parse(text) {
            Ok(ClientFrame::Subscribe { event }) => {
                self.subscribe(socket, &event).await;
            }
            Ok(ClientFrame::Unsubscribe { event }) => {
                self.unsubscribe(socket, &event).await;
            }
            Ok(ClientFrame::Signal(_)) => {
                debug!(peer = %socket.identity.redacted(), "Ignored signal on hub socket")
            }
            Err(e) => warn!(peer = %socket.identity.redacted(), error = %e, "Dropped malformed hub frame"),
        }
    }

    /// Forget a hub socket after it closed.
    pub async fn disconnect(&self, identity: &Identity, socket_id: SocketId) {
        self.registry.remove(identity, socket_id).await;
        self.prune(socket_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use serde_json::json;
    use speer_core::Error;
    use tokio::sync::mpsc;

    async fn connect(hub: &Hub, name: &str) -> (SocketRef, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = hub.registry().register(Identity::from(name), tx).await;
        (socket, rx)
    }

    fn event(outbound: Option<Outbound>) -> Value {
        match outbound {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    struct Greeting;

    #[async_trait]
    impl PrepareData for Greeting {
        async fn prepare(&self, recipient: &Identity, data: &Value) -> Result<Value> {
            if recipient.as_str() == "carol" {
                return Err(Error::InvalidState("no greeting for carol".into()));
            }
            Ok(json!({"to": recipient.as_str(), "from": data}))
        }
    }

    #[tokio::test]
    async fn test_dispatch_with_filter_and_transform() {
        let hub = Hub::new(Arc::new(ConnectionRegistry::new("hub")));
        let (alice, mut rx_alice) = connect(&hub, "alice").await;
        let (bob, mut rx_bob) = connect(&hub, "bob").await;
        let (carol, mut rx_carol) = connect(&hub, "carol").await;
        for socket in [&alice, &bob, &carol] {
            assert!(hub.subscribe(socket, "login").await);
        }

        let delivered = hub.dispatch("login", json!("dave"), None, Some(&Greeting)).await;
        assert_eq!(delivered, 2);
        assert_eq!(
            event(rx_alice.recv().await),
            json!({"event": "login", "data": {"to": "alice", "from": "dave"}})
        );
        assert_eq!(event(rx_bob.recv().await)["data"]["to"], "bob");
        assert!(rx_carol.try_recv().is_err());

        let only_bob = [Identity::from("bob")];
        assert_eq!(hub.dispatch("login", json!("erin"), Some(&only_bob), None).await, 1);
        assert_eq!(event(rx_bob.recv().await), json!({"event": "login", "data": "erin"}));
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_prune() {
        let hub = Hub::new(Arc::new(ConnectionRegistry::new("hub")));
        let (alice, _rx_alice) = connect(&hub, "alice").await;
        let (bob, _rx_bob) = connect(&hub, "bob").await;
        hub.subscribe(&alice, "login").await;
        hub.subscribe(&alice, "logout").await;
        hub.subscribe(&bob, "login").await;

        assert!(hub.unsubscribe(&bob, "login").await);
        assert!(!hub.unsubscribe(&bob, "login").await);
        assert_eq!(hub.subscribers("login").await, vec![Identity::from("alice")]);

        hub.disconnect(&alice.identity, alice.socket_id).await;
        assert!(hub.subscribers("login").await.is_empty());
        assert!(hub.subscribers("logout").await.is_empty());
        assert_eq!(hub.dispatch("login", Value::Null, None, None).await, 0);
    }

    #[tokio::test]
    async fn test_displaced_socket_loses_subscriptions() {
        let hub = Hub::new(Arc::new(ConnectionRegistry::new("hub")));
        let (old, _rx_old) = connect(&hub, "alice").await;
        hub.subscribe(&old, "login").await;
        let (new, mut rx_new) = connect(&hub, "alice").await;

        // The old socket may not subscribe any more and its entry delivers nothing.
        assert!(!hub.subscribe(&old, "logout").await);
        assert_eq!(hub.dispatch("login", json!(1), None, None).await, 0);

        hub.handle_frame(&new, r#"{"action":"subscribe","event":"login"}"#).await;
        assert_eq!(hub.dispatch("login", json!(2), None, None).await, 1);
        assert_eq!(event(rx_new.recv().await)["data"], 2);

        hub.disconnect(&old.identity, old.socket_id).await;
        assert_eq!(hub.subscribers("login").await, vec![Identity::from("alice")]);
    }
}
