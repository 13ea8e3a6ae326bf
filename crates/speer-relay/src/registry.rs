//! Connection registry.
//!
//! Maps each identity to at most one live socket. A new socket for an
//! identity displaces the old one; sockets that stop answering liveness
//! probes are evicted.
//!
//! ```text
//!   probe N:   alive=true  -> alive=false, ping
//!   probe N+1: alive=false -> evicted (no pong since probe N)
//! ```
//!
//! The relay and the hub each own one registry.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use speer_core::protocol::ServerFrame;
use speer_core::Identity;

/// Process-unique socket number.
pub type SocketId = u64;

/// Instruction for a socket's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text frame.
    Text(String),
    /// Send a liveness probe.
    Ping,
    /// Close the socket.
    Terminate,
}

/// Queue feeding a socket's writer.
pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// Handle to a registered socket.
#[derive(Debug, Clone)]
pub struct SocketRef {
    /// Authenticated owner.
    pub identity: Identity,
    /// Distinguishes this socket from earlier and later ones of the same identity.
    pub socket_id: SocketId,
    tx: OutboundTx,
}

impl SocketRef {
    /// Queue a frame. Returns false if the socket is gone.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.to_text() {
            Ok(text) => self.tx.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                warn!(error = %e, "Could not encode frame");
                false
            }
        }
    }
}

/// Notified when an identity gains or loses its socket.
#[async_trait]
pub trait PresenceListener: Send + Sync {
    /// `online` is true when the identity registered, false when it left.
    async fn on_presence_change(&self, identity: &Identity, online: bool);
}

struct Entry {
    socket_id: SocketId,
    tx: OutboundTx,
    alive: bool,
    created_at: Instant,
}

/// Identity to socket map with displacement and liveness eviction.
pub struct ConnectionRegistry {
    name: &'static str,
    sockets: RwLock<HashMap<Identity, Entry>>,
    next_id: AtomicU64,
    presence: Option<Arc<dyn PresenceListener>>,
    // Held across a map change and its notifications so listeners see
    // presence changes in the order they happened.
    presence_order: Mutex<()>,
}

impl ConnectionRegistry {
    /// Create an empty registry. `name` tags its log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sockets: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            presence: None,
            presence_order: Mutex::new(()),
        }
    }

    /// Report presence changes to `listener`.
    pub fn with_presence(mut self, listener: Arc<dyn PresenceListener>) -> Self {
        self.presence = Some(listener);
        self
    }

    async fn notify(&self, identity: &Identity, online: bool) {
        if let Some(listener) = &self.presence {
            listener.on_presence_change(identity, online).await;
        }
    }

    /// Register a socket for `identity`, terminating any previous one.
    pub async fn register(&self, identity: Identity, tx: OutboundTx) -> SocketRef {
        let _order = self.presence_order.lock().await;
        let socket_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            socket_id,
            tx: tx.clone(),
            alive: true,
            created_at: Instant::now(),
        };
        let displaced = self.sockets.write().await.insert(identity.clone(), entry);

        if let Some(old) = displaced {
            let _ = old.tx.send(Outbound::Terminate);
            info!(
                registry = self.name,
                peer = %identity.redacted(),
                age_secs = old.created_at.elapsed().as_secs(),
                "Socket displaced"
            );
            self.notify(&identity, false).await;
        }

        info!(registry = self.name, peer = %identity.redacted(), socket_id, "Socket registered");
        self.notify(&identity, true).await;
        SocketRef {
            identity,
            socket_id,
            tx,
        }
    }

    /// Current socket of `identity`.
    pub async fn lookup(&self, identity: &Identity) -> Option<SocketRef> {
        self.sockets.read().await.get(identity).map(|entry| SocketRef {
            identity: identity.clone(),
            socket_id: entry.socket_id,
            tx: entry.tx.clone(),
        })
    }

    /// Whether `identity` has a live socket.
    pub async fn is_online(&self, identity: &Identity) -> bool {
        self.sockets.read().await.contains_key(identity)
    }

    /// Remove `identity` if `socket_id` is still its current socket.
    pub async fn remove(&self, identity: &Identity, socket_id: SocketId) -> bool {
        let _order = self.presence_order.lock().await;
        let removed = {
            let mut sockets = self.sockets.write().await;
            match sockets.get(identity) {
                Some(entry) if entry.socket_id == socket_id => sockets.remove(identity).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(registry = self.name, peer = %identity.redacted(), socket_id, "Socket removed");
            self.notify(identity, false).await;
        }
        removed
    }

    /// Every identity with a live socket.
    pub async fn list_live_identities(&self) -> HashSet<Identity> {
        self.sockets.read().await.keys().cloned().collect()
    }

    /// Number of live sockets.
    pub async fn len(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Whether no socket is registered.
    pub async fn is_empty(&self) -> bool {
        self.sockets.read().await.is_empty()
    }

    /// Record a pong from `socket_id`.
    pub async fn mark_alive(&self, identity: &Identity, socket_id: SocketId) {
        if let Some(entry) = self.sockets.write().await.get_mut(identity) {
            if entry.socket_id == socket_id {
                entry.alive = true;
            }
        }
    }

    /// Queue `frame` for `identity`. Returns false if it has no socket.
    pub async fn send_to(&self, identity: &Identity, frame: &ServerFrame) -> bool {
        match self.lookup(identity).await {
            Some(socket) => socket.send_frame(frame),
            None => false,
        }
    }

    /// Run one liveness round and return the evicted identities.
    pub async fn probe(&self) -> Vec<Identity> {
        let _order = self.presence_order.lock().await;
        let evicted: Vec<Identity> = {
            let mut sockets = self.sockets.write().await;
            let dead: Vec<Identity> = sockets
                .iter()
                .filter(|(_, entry)| !entry.alive)
                .map(|(identity, _)| identity.clone())
                .collect();
            for identity in &dead {
                if let Some(entry) = sockets.remove(identity) {
                    let _ = entry.tx.send(Outbound::Terminate);
                }
            }
            for entry in sockets.values_mut() {
                entry.alive = false;
                let _ = entry.tx.send(Outbound::Ping);
            }
            dead
        };

        for identity in &evicted {
            warn!(registry = self.name, peer = %identity.redacted(), "Socket evicted, no pong");
            self.notify(identity, false).await;
        }
        evicted
    }

    /// Probe every `period` until the registry is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.probe().await;
                let live = registry.len().await;
                debug!(
                    registry = registry.name,
                    evicted = evicted.len(),
                    live,
                    "Heartbeat completed"
                );
            }
        })
    }
}
