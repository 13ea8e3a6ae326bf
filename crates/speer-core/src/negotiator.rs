//! Peer connection negotiator.
//!
//! Drives offer/answer exchanges through the relay and wraps the resulting
//! peer channel with the sub-protocol the negotiation was tagged with.
//!
//! ```text
//!  initiator                      relay                     responder
//!  create_offer ── signal{offer} ───▶ authorize ── signal ──▶ accept_offer
//!  complete     ◀─ signal{answer} ── authorize ◀─ signal ──  on_connection
//! ```
//!
//! At most one negotiation is pending per remote identity. A signal from a
//! remote with a pending initiator negotiation is its answer; a signal from
//! any other remote is a fresh offer.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::FrameHandler;
use crate::connection::{
    CallConnection, CallHandler, Connection, FileConfig, FileConnection, FileHandler,
    MessageConnection, MessageHandler,
};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{ErrorFrame, ForwardedSignal, ServerFrame, SignalFrame, SubProtocol};
use crate::transport::{PeerChannel, PeerFactory, PendingPeer};

/// Default time to wait for an answer.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiator configuration.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Pending negotiations are abandoned after this long.
    pub negotiation_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

/// Outbound path for signals, normally the relay websocket.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Send one signal addressed to `frame.remote_id`.
    async fn send_signal(&self, frame: SignalFrame) -> Result<()>;
}

/// Owner of connections opened by remote peers.
pub trait ConnectionAcceptor: Send + Sync {
    /// Handler for an incoming messaging connection from `remote`.
    fn message_handler(&self, remote: &Identity) -> Arc<dyn MessageHandler>;

    /// Handler for an incoming file connection from `remote`.
    fn file_handler(&self, remote: &Identity) -> Arc<dyn FileHandler>;

    /// Transfer settings for an incoming file connection.
    fn file_config(&self, _remote: &Identity) -> FileConfig {
        FileConfig::default()
    }

    /// Handler for an incoming call connection from `remote`.
    fn call_handler(&self, remote: &Identity) -> Arc<dyn CallHandler>;

    /// A remote peer opened a connection.
    fn on_connection(&self, connection: Connection);

    /// A group signal arrived. `from` is absent on group completion.
    fn on_group_signal(&self, _from: Option<&Identity>, _peer_data: Value, _data: Value) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

type Reply = oneshot::Sender<Result<Arc<dyn PeerChannel>>>;

struct PendingNegotiation {
    id: u64,
    role: Role,
    kind: SubProtocol,
    peer: Option<Box<dyn PendingPeer>>,
    reply: Option<Reply>,
}

struct NegotiatorInner {
    factory: Arc<dyn PeerFactory>,
    signals: Arc<dyn SignalSink>,
    acceptor: Arc<dyn ConnectionAcceptor>,
    config: NegotiatorConfig,
    pending: Mutex<HashMap<Identity, PendingNegotiation>>,
    next_id: AtomicU64,
}

/// Client-side negotiator. Cheap to clone.
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<NegotiatorInner>,
}

/// Removes a pending entry when its owner gives up, unless it was taken.
struct PendingGuard<'a> {
    inner: &'a NegotiatorInner,
    remote: Identity,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.remove_pending(&self.remote, self.id);
    }
}

impl Negotiator {
    /// Create a negotiator.
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        signals: Arc<dyn SignalSink>,
        acceptor: Arc<dyn ConnectionAcceptor>,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NegotiatorInner {
                factory,
                signals,
                acceptor,
                config,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a messaging connection to `remote`.
    pub async fn create_connection(
        &self,
        remote: &Identity,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<MessageConnection> {
        let channel = self.inner.negotiate(remote, SubProtocol::Basic).await?;
        Ok(MessageConnection::new(channel, handler))
    }

    /// Open a file connection to `remote`.
    pub async fn create_file_connection(
        &self,
        remote: &Identity,
        handler: Arc<dyn FileHandler>,
        config: FileConfig,
    ) -> Result<FileConnection> {
        let channel = self.inner.negotiate(remote, SubProtocol::Binary).await?;
        Ok(FileConnection::new(channel, handler, config))
    }

    /// Open a call control connection to `remote`.
    pub async fn create_call_connection(
        &self,
        remote: &Identity,
        handler: Arc<dyn CallHandler>,
    ) -> Result<CallConnection> {
        let channel = self.inner.negotiate(remote, SubProtocol::Call).await?;
        Ok(CallConnection::new(channel, handler))
    }

    /// Number of negotiations in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Process a signal forwarded by the relay.
    pub async fn handle_signal(&self, signal: ForwardedSignal) {
        Arc::clone(&self.inner).handle_signal(signal).await;
    }

    /// Process an error reported by the relay.
    pub fn handle_error(&self, error: ErrorFrame) {
        self.inner.handle_error(error);
    }

    /// Reject every pending negotiation; the relay connection is gone.
    pub fn reject_all(&self) {
        let drained: Vec<_> = self.inner.lock_pending().drain().collect();
        for (remote, negotiation) in drained {
            debug!(peer = %remote.redacted(), "Negotiation abandoned, relay closed");
            if let Some(reply) = negotiation.reply {
                let _ = reply.send(Err(Error::ChannelClosed));
            }
        }
    }
}

#[async_trait]
impl FrameHandler for Negotiator {
    async fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Signal(signal) => {
                tokio::spawn(Arc::clone(&self.inner).handle_signal(signal));
            }
            ServerFrame::Error(error) => self.inner.handle_error(error),
            ServerFrame::Event(event) => {
                debug!(event = %event.event, "Ignored hub event on relay connection")
            }
        }
    }

    async fn on_close(&self) {
        self.reject_all();
    }
}

impl NegotiatorInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Identity, PendingNegotiation>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_pending(&self, remote: &Identity, id: u64) -> Option<PendingNegotiation> {
        let mut pending = self.lock_pending();
        match pending.get(remote) {
            Some(entry) if entry.id == id => pending.remove(remote),
            _ => None,
        }
    }

    /// Reserve the slot for `remote`, failing if a negotiation is pending.
    fn reserve(
        &self,
        remote: &Identity,
        role: Role,
        kind: SubProtocol,
        peer: Option<Box<dyn PendingPeer>>,
        reply: Option<Reply>,
    ) -> Result<u64> {
        let mut pending = self.lock_pending();
        if pending.contains_key(remote) {
            return Err(Error::NegotiationInProgress);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            remote.clone(),
            PendingNegotiation {
                id,
                role,
                kind,
                peer,
                reply,
            },
        );
        Ok(id)
    }

    async fn negotiate(&self, remote: &Identity, kind: SubProtocol) -> Result<Arc<dyn PeerChannel>> {
        if self.lock_pending().contains_key(remote) {
            return Err(Error::NegotiationInProgress);
        }

        let (peer, offer) = self.factory.create_offer(remote).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.reserve(remote, Role::Initiator, kind, Some(peer), Some(reply_tx))?;
        let _guard = PendingGuard {
            inner: self,
            remote: remote.clone(),
            id,
        };

        info!(peer = %remote.redacted(), kind = kind.as_str(), "Starting negotiation");
        self.signals
            .send_signal(SignalFrame {
                remote_id: remote.clone(),
                kind,
                peer_data: offer,
                data: None,
            })
            .await?;

        match tokio::time::timeout(self.config.negotiation_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                warn!(peer = %remote.redacted(), "Negotiation timed out");
                Err(Error::Timeout)
            }
        }
    }

    async fn handle_signal(self: Arc<Self>, signal: ForwardedSignal) {
        let remote = match signal.remote_id.clone() {
            Some(remote) => remote,
            None if signal.kind == SubProtocol::Group => {
                self.acceptor.on_group_signal(None, signal.peer_data, signal.data);
                return;
            }
            None => {
                debug!("Dropped signal without sender");
                return;
            }
        };

        if signal.kind == SubProtocol::Group {
            self.acceptor
                .on_group_signal(Some(&remote), signal.peer_data, signal.data);
            return;
        }

        let answered = {
            let mut pending = self.lock_pending();
            match pending.get(&remote) {
                Some(entry) if entry.role == Role::Initiator => pending.remove(&remote),
                _ => None,
            }
        };

        match answered {
            Some(negotiation) => self.complete(remote, negotiation, signal).await,
            None => self.respond(remote, signal.kind, signal.peer_data).await,
        }
    }

    async fn complete(&self, remote: Identity, negotiation: PendingNegotiation, signal: ForwardedSignal) {
        let result = match negotiation.peer {
            _ if negotiation.kind != signal.kind => Err(Error::Protocol(format!(
                "answer tagged {} for a {} negotiation",
                signal.kind.as_str(),
                negotiation.kind.as_str()
            ))),
            Some(peer) => peer.complete(signal.peer_data).await,
            None => Err(Error::InvalidState("negotiation without peer".into())),
        };

        match &result {
            Ok(_) => info!(peer = %remote.redacted(), kind = negotiation.kind.as_str(), "Negotiation complete"),
            Err(e) => warn!(peer = %remote.redacted(), error = %e, "Negotiation failed"),
        }
        if let Some(reply) = negotiation.reply {
            let _ = reply.send(result);
        }
    }

    async fn respond(&self, remote: Identity, kind: SubProtocol, offer: Value) {
        let id = match self.reserve(&remote, Role::Responder, kind, None, None) {
            Ok(id) => id,
            Err(_) => {
                warn!(peer = %remote.redacted(), "Dropped offer, negotiation already pending");
                return;
            }
        };

        let accepted = self.factory.accept_offer(&remote, offer).await;
        self.remove_pending(&remote, id);

        let (channel, answer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if e.is_channel_failure() => {
                debug!(peer = %remote.redacted(), error = %e, "Offer unreachable");
                return;
            }
            Err(e) => {
                warn!(peer = %remote.redacted(), error = %e, "Could not accept offer");
                return;
            }
        };

        let frame = SignalFrame {
            remote_id: remote.clone(),
            kind,
            peer_data: answer,
            data: None,
        };
        if let Err(e) = self.signals.send_signal(frame).await {
            warn!(peer = %remote.redacted(), error = %e, "Could not send answer");
            channel.close().await;
            return;
        }

        info!(peer = %remote.redacted(), kind = kind.as_str(), "Accepted connection");
        let connection = match kind {
            SubProtocol::Basic => Connection::Message(MessageConnection::new(
                channel,
                self.acceptor.message_handler(&remote),
            )),
            SubProtocol::Binary => Connection::File(FileConnection::new(
                channel,
                self.acceptor.file_handler(&remote),
                self.acceptor.file_config(&remote),
            )),
            SubProtocol::Call => Connection::Call(CallConnection::new(
                channel,
                self.acceptor.call_handler(&remote),
            )),
            SubProtocol::Group => return,
        };
        self.acceptor.on_connection(connection);
    }

    fn handle_error(&self, error: ErrorFrame) {
        let remote = match error.remote_id {
            Some(remote) => remote,
            None => {
                warn!(error = %error.error, "Relay error");
                return;
            }
        };

        let negotiation = {
            let mut pending = self.lock_pending();
            match pending.get(&remote) {
                Some(entry) if entry.role == Role::Initiator => pending.remove(&remote),
                _ => None,
            }
        };
        match negotiation.and_then(|n| n.reply) {
            Some(reply) => {
                warn!(peer = %remote.redacted(), error = %error.error, "Relay refused negotiation");
                let _ = reply.send(Err(Error::AuthorizationDenied(error.error)));
            }
            None => debug!(peer = %remote.redacted(), error = %error.error, "Relay error without negotiation"),
        }
    }
}
