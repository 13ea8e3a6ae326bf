//! Peer channel abstraction.
//!
//! A peer channel is the direct, relay-independent transport produced by a
//! successful negotiation. Implementations:
//! - [`tcp`]: direct TCP sockets (production, CLI)
//! - [`memory`]: in-process pairs (testing/simulation)
//!
//! Sub-protocols only see the [`PeerChannel`] trait; the negotiator only
//! sees [`PeerFactory`].

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::PeerFrame;

pub use memory::{MemoryChannel, MemoryNetwork, MemoryPeerFactory};
pub use tcp::{TcpChannel, TcpPeerConfig, TcpPeerFactory};

/// An established, message-oriented channel to one peer.
///
/// Frames keep their kind (text or binary) end to end.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Identity of the peer on the other end.
    fn remote(&self) -> &Identity;

    /// Queue a frame for sending.
    async fn send(&self, frame: PeerFrame) -> Result<()>;

    /// Next inbound frame, `None` once the channel is closed.
    async fn recv(&self) -> Option<PeerFrame>;

    /// Bytes queued for sending but not yet handed to the peer.
    fn buffered_amount(&self) -> usize;

    /// Resolve once the buffered amount is at or below `threshold`,
    /// or the channel closed.
    async fn drained_below(&self, threshold: usize);

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Close both directions. Idempotent.
    async fn close(&self);
}

/// Produces peer channels from offer/answer payloads carried by the relay.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Start an initiator negotiation towards `remote`.
    ///
    /// Returns the half-open peer and the offer to signal.
    async fn create_offer(&self, remote: &Identity) -> Result<(Box<dyn PendingPeer>, Value)>;

    /// Answer an offer received from `remote`.
    ///
    /// Returns the established channel and the answer to signal back.
    async fn accept_offer(
        &self,
        remote: &Identity,
        offer: Value,
    ) -> Result<(Arc<dyn PeerChannel>, Value)>;
}

/// Initiator side of a negotiation waiting for its answer.
#[async_trait]
pub trait PendingPeer: Send {
    /// Complete the negotiation with the remote answer.
    async fn complete(self: Box<Self>, answer: Value) -> Result<Arc<dyn PeerChannel>>;
}

/// Outbound byte counter with a "drained" wakeup, shared by channel backends.
#[derive(Default)]
pub(crate) struct BufferGauge {
    bytes: AtomicUsize,
    drained: Notify,
}

impl BufferGauge {
    pub(crate) fn add(&self, len: usize) {
        self.bytes.fetch_add(len, Ordering::AcqRel);
    }

    pub(crate) fn release(&self, len: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(len)));
        self.drained.notify_waiters();
    }

    pub(crate) fn current(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Wait until at most `threshold` bytes are queued or `closed` flips.
    pub(crate) async fn wait_below(&self, threshold: usize, closed: &watch::Sender<bool>) {
        let mut closed = closed.subscribe();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current() <= threshold || *closed.borrow() {
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = closed.changed() => {}
            }
        }
    }

    /// Wake every waiter, used on close.
    pub(crate) fn wake_all(&self) {
        self.drained.notify_waiters();
    }
}

pub(crate) type SharedGauge = Arc<BufferGauge>;

/// Resolve once `closed` reads true. The borrowed value is released before
/// returning, so the future stays `Send` inside `select!`.
pub(crate) async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
