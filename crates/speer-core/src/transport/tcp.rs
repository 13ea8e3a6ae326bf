//! Direct TCP peer channels.
//!
//! The initiator opens an ephemeral listener and signals `{addr, token}`.
//! The responder connects, sends the token as its first frame and signals
//! `{token}` back. Every later frame uses the kind/length encoding of
//! [`crate::protocol::FrameReader`].

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{closed_signal, BufferGauge, PeerChannel, PeerFactory, PendingPeer, SharedGauge};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{FrameReader, PeerFrame};

/// Default connect/accept timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an inbound connection may take to present its token.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for direct TCP channels.
#[derive(Debug, Clone)]
pub struct TcpPeerConfig {
    /// Address the offer listener binds to.
    pub bind_ip: IpAddr,
    /// Address advertised in offers (defaults to `bind_ip`).
    pub advertise_ip: Option<IpAddr>,
    /// How long to wait for the other side to connect.
    pub connect_timeout: Duration,
}

impl Default for TcpPeerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_ip: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpOffer {
    addr: SocketAddr,
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpAnswer {
    token: String,
}

/// [`PeerFactory`] producing [`TcpChannel`]s.
pub struct TcpPeerFactory {
    config: TcpPeerConfig,
}

impl TcpPeerFactory {
    /// Create a factory.
    pub fn new(config: TcpPeerConfig) -> Self {
        Self { config }
    }
}

impl Default for TcpPeerFactory {
    fn default() -> Self {
        Self::new(TcpPeerConfig::default())
    }
}

#[async_trait]
impl PeerFactory for TcpPeerFactory {
    async fn create_offer(&self, remote: &Identity) -> Result<(Box<dyn PendingPeer>, Value)> {
        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        let ip = self.config.advertise_ip.unwrap_or(self.config.bind_ip);
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let offer = serde_json::to_value(TcpOffer {
            addr: SocketAddr::new(ip, port),
            token: token.clone(),
        })?;
        debug!(peer = %remote.redacted(), port, "TCP offer listening");

        let pending = TcpPendingPeer {
            remote: remote.clone(),
            listener,
            token,
            timeout: self.config.connect_timeout,
        };
        Ok((Box::new(pending), offer))
    }

    async fn accept_offer(
        &self,
        remote: &Identity,
        offer: Value,
    ) -> Result<(Arc<dyn PeerChannel>, Value)> {
        let offer: TcpOffer =
            serde_json::from_value(offer).map_err(|e| Error::Protocol(e.to_string()))?;

        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(offer.addr),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Connection(e.to_string()))?;
        stream.set_nodelay(true)?;

        let hello = PeerFrame::Text(offer.token.clone()).encode()?;
        stream.write_all(&hello).await?;

        let channel = TcpChannel::spawn(remote.clone(), stream, FrameReader::new());
        let answer = serde_json::to_value(TcpAnswer { token: offer.token })?;
        Ok((Arc::new(channel), answer))
    }
}

struct TcpPendingPeer {
    remote: Identity,
    listener: TcpListener,
    token: String,
    timeout: Duration,
}

#[async_trait]
impl PendingPeer for TcpPendingPeer {
    async fn complete(self: Box<Self>, answer: Value) -> Result<Arc<dyn PeerChannel>> {
        let answer: TcpAnswer =
            serde_json::from_value(answer).map_err(|e| Error::Protocol(e.to_string()))?;
        if answer.token != self.token {
            return Err(Error::Protocol("answer does not match offer".into()));
        }

        // Handshakes run side by side so a silent connection cannot hold up
        // the real responder.
        let accept = async {
            let mut handshakes = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = self.listener.accept() => {
                        let (stream, addr) = accepted?;
                        handshakes.spawn(read_token(stream, addr, self.token.clone()));
                    }
                    Some(joined) = handshakes.join_next() => {
                        if let Ok(Some((stream, reader))) = joined {
                            stream.set_nodelay(true)?;
                            return Ok::<_, Error>((stream, reader));
                        }
                    }
                }
            }
        };

        let (stream, reader) = tokio::time::timeout(self.timeout, accept)
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(Arc::new(TcpChannel::spawn(self.remote, stream, reader)))
    }
}

/// Read the opening token of an inbound connection. `None` unless it
/// matches `expected` within [`HANDSHAKE_TIMEOUT`].
async fn read_token(
    mut stream: TcpStream,
    addr: SocketAddr,
    expected: String,
) -> Option<(TcpStream, FrameReader)> {
    let mut reader = FrameReader::new();
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream, &mut reader)).await {
        Ok(Ok(Some(PeerFrame::Text(token)))) if token == expected => Some((stream, reader)),
        Err(_) => {
            debug!(?addr, "TCP connection sent no token in time");
            None
        }
        _ => {
            warn!(?addr, "Rejected TCP connection with wrong token");
            None
        }
    }
}

/// Read one frame, buffering any extra bytes in `reader`.
async fn read_frame(stream: &mut TcpStream, reader: &mut FrameReader) -> Result<Option<PeerFrame>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = reader.try_read()? {
            return Ok(Some(frame));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        reader.push(&buf[..n]);
    }
}

/// Peer channel over a TCP stream.
///
/// A writer task drains the outbound queue; the buffered amount counts
/// queued bytes not yet written to the socket.
pub struct TcpChannel {
    remote: Identity,
    outbound: mpsc::UnboundedSender<PeerFrame>,
    inbound: Mutex<mpsc::UnboundedReceiver<PeerFrame>>,
    gauge: SharedGauge,
    closed: Arc<watch::Sender<bool>>,
}

impl TcpChannel {
    /// Wrap a connected stream. `reader` may already hold buffered bytes.
    pub fn spawn(remote: Identity, stream: TcpStream, reader: FrameReader) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let gauge: SharedGauge = Arc::new(BufferGauge::default());
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        tokio::spawn(read_loop(read_half, reader, in_tx, Arc::clone(&closed)));
        tokio::spawn(write_loop(
            write_half,
            out_rx,
            Arc::clone(&gauge),
            Arc::clone(&closed),
        ));

        Self {
            remote,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            gauge,
            closed,
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut reader: FrameReader,
    in_tx: mpsc::UnboundedSender<PeerFrame>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    let mut buf = vec![0u8; 64 * 1024];
    'outer: loop {
        loop {
            match reader.try_read() {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).is_err() {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Malformed frame on TCP channel");
                    break 'outer;
                }
            }
        }

        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => reader.push(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "TCP channel read failed");
                    break;
                }
            },
            _ = closed_signal(&mut closed_rx) => break,
        }
    }
    closed.send_replace(true);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<PeerFrame>,
    gauge: SharedGauge,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            biased;
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let len = frame.len();
                let written = match frame.encode() {
                    Ok(bytes) => write_half.write_all(&bytes).await.map_err(Error::from),
                    Err(e) => Err(e),
                };
                gauge.release(len);
                if let Err(e) = written {
                    debug!(error = %e, "TCP channel write failed");
                    break;
                }
            }
            _ = closed_signal(&mut closed_rx) => break,
        }
    }
    closed.send_replace(true);
    gauge.wake_all();
    let _ = write_half.shutdown().await;
}

#[async_trait]
impl PeerChannel for TcpChannel {
    fn remote(&self) -> &Identity {
        &self.remote
    }

    async fn send(&self, frame: PeerFrame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        let len = frame.len();
        self.gauge.add(len);
        if self.outbound.send(frame).is_err() {
            self.gauge.release(len);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<PeerFrame> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            frame = inbound.recv() => frame,
            _ = closed_signal(&mut closed) => None,
        }
    }

    fn buffered_amount(&self) -> usize {
        self.gauge.current()
    }

    async fn drained_below(&self, threshold: usize) {
        self.gauge.wait_below(threshold, &self.closed).await
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.gauge.wake_all();
    }
}
