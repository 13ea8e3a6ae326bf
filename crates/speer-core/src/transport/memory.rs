//! In-process peer channels.
//!
//! [`MemoryNetwork`] is an explicitly constructed rendezvous point: share one
//! instance between every [`MemoryPeerFactory`] that should be able to reach
//! the others.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};

use super::{closed_signal, BufferGauge, PeerChannel, PeerFactory, PendingPeer, SharedGauge};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::PeerFrame;

/// One end of an in-memory channel pair.
///
/// The buffered amount counts bytes the peer has not received yet.
pub struct MemoryChannel {
    remote: Identity,
    tx: mpsc::UnboundedSender<PeerFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<PeerFrame>>,
    outbound: SharedGauge,
    inbound: SharedGauge,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryChannel {
    /// Create a pair of connected channels.
    ///
    /// The first end belongs to `id_a` and talks to `id_b`.
    pub fn pair(id_a: impl Into<Identity>, id_b: impl Into<Identity>) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a_to_b: SharedGauge = Arc::new(BufferGauge::default());
        let b_to_a: SharedGauge = Arc::new(BufferGauge::default());
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let chan_a = MemoryChannel {
            remote: id_b.into(),
            tx: tx_b,
            rx: Mutex::new(rx_a),
            outbound: Arc::clone(&a_to_b),
            inbound: Arc::clone(&b_to_a),
            closed: Arc::clone(&closed),
        };
        let chan_b = MemoryChannel {
            remote: id_a.into(),
            tx: tx_a,
            rx: Mutex::new(rx_b),
            outbound: b_to_a,
            inbound: a_to_b,
            closed,
        };

        (chan_a, chan_b)
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn remote(&self) -> &Identity {
        &self.remote
    }

    async fn send(&self, frame: PeerFrame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        let len = frame.len();
        self.outbound.add(len);
        if self.tx.send(frame).is_err() {
            self.outbound.release(len);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<PeerFrame> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => {
                if let Some(frame) = &frame {
                    self.inbound.release(frame.len());
                }
                frame
            }
            _ = closed_signal(&mut closed) => None,
        }
    }

    fn buffered_amount(&self) -> usize {
        self.outbound.current()
    }

    async fn drained_below(&self, threshold: usize) {
        self.outbound.wait_below(threshold, &self.closed).await
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.outbound.wake_all();
        self.inbound.wake_all();
    }
}

/// Shared rendezvous for in-memory negotiations.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    offers: Arc<StdMutex<HashMap<String, MemoryChannel>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for a client with identity `local`.
    pub fn factory(&self, local: impl Into<Identity>) -> MemoryPeerFactory {
        MemoryPeerFactory {
            local: local.into(),
            network: self.clone(),
        }
    }

    /// Number of offers waiting for an answer.
    pub fn pending_offers(&self) -> usize {
        self.offers.lock().map(|offers| offers.len()).unwrap_or(0)
    }

    fn park(&self, token: String, channel: MemoryChannel) -> Result<()> {
        let mut offers = self
            .offers
            .lock()
            .map_err(|_| Error::InvalidState("memory network poisoned".into()))?;
        offers.insert(token, channel);
        Ok(())
    }

    fn take(&self, token: &str) -> Option<MemoryChannel> {
        self.offers.lock().ok().and_then(|mut offers| offers.remove(token))
    }
}

/// [`PeerFactory`] backed by a [`MemoryNetwork`].
pub struct MemoryPeerFactory {
    local: Identity,
    network: MemoryNetwork,
}

fn offer_token(value: &Value) -> Result<String> {
    value
        .get("token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol("missing memory token".into()))
}

#[async_trait]
impl PeerFactory for MemoryPeerFactory {
    async fn create_offer(&self, remote: &Identity) -> Result<(Box<dyn PendingPeer>, Value)> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let (local_end, remote_end) = MemoryChannel::pair(self.local.clone(), remote.clone());
        self.network.park(token.clone(), remote_end)?;

        let pending = MemoryPendingPeer {
            token: token.clone(),
            channel: Some(local_end),
            network: self.network.clone(),
        };
        Ok((Box::new(pending), json!({ "token": token })))
    }

    async fn accept_offer(
        &self,
        remote: &Identity,
        offer: Value,
    ) -> Result<(Arc<dyn PeerChannel>, Value)> {
        let token = offer_token(&offer)?;
        let channel = self
            .network
            .take(&token)
            .ok_or_else(|| Error::Protocol("unknown memory offer".into()))?;
        if channel.remote() != remote {
            return Err(Error::Protocol("memory offer from a different peer".into()));
        }
        Ok((Arc::new(channel), json!({ "token": token })))
    }
}

struct MemoryPendingPeer {
    token: String,
    channel: Option<MemoryChannel>,
    network: MemoryNetwork,
}

#[async_trait]
impl PendingPeer for MemoryPendingPeer {
    async fn complete(mut self: Box<Self>, answer: Value) -> Result<Arc<dyn PeerChannel>> {
        if offer_token(&answer)? != self.token {
            return Err(Error::Protocol("answer does not match offer".into()));
        }
        let channel = self
            .channel
            .take()
            .ok_or_else(|| Error::InvalidState("negotiation already completed".into()))?;
        Ok(Arc::new(channel))
    }
}

impl Drop for MemoryPendingPeer {
    fn drop(&mut self) {
        // Offer never answered: unpark the remote end.
        if self.channel.is_some() {
            let _ = self.network.take(&self.token);
        }
    }
}
