//! File transfer sub-protocol.
//!
//! Send and receive sides are independent state machines:
//!
//! ```text
//! sender:   Idle ──request──▶ AwaitingAnswer ──accept──▶ Transferring ──complete──▶ Idle
//!                                   └──────decline──────────────────────────────────▶ Idle
//! receiver: Idle ──request──▶ AwaitingDecision ──accept──▶ Transferring ──last chunk──▶ Idle
//! ```
//!
//! Control frames are text, chunks are binary. The sender pushes one batch of
//! chunks back-to-back, then waits for the channel's buffered amount to drop
//! below the low-water mark before the next batch. No acknowledgment frames
//! are exchanged during the transfer; the receiver sends a single `complete`
//! once the last chunk arrived, which is when the sender's `send` resolves.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::logging::RedactedBytes;
use crate::protocol::{Decision, FileControl, FileMetadata, PeerFrame};
use crate::transport::PeerChannel;

/// Default chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of chunks per batch (≈ 6.4 MiB).
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default progress callback frequency, in chunks.
pub const DEFAULT_PROGRESS_EVERY: u64 = 10;

/// Default low-water mark as a fraction of one batch's bytes.
pub const DEFAULT_LOW_WATER_RATIO: f64 = 0.3;

/// Progress callback, called with a fraction in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// How received data is handed to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Buffer every chunk, deliver one assembled file.
    Accumulate,
    /// Deliver each chunk as it arrives, then a zero-length terminal chunk.
    #[default]
    Emit,
}

/// File transfer tuning.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Chunks sent back-to-back before waiting for the buffer to drain.
    pub batch_size: usize,
    /// Receiver progress is reported every this many chunks.
    pub progress_every: u64,
    /// Delivery mode for received files.
    pub mode: DeliveryMode,
    /// Low-water mark as a fraction of one batch's bytes.
    pub low_water_ratio: f64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_every: DEFAULT_PROGRESS_EVERY,
            mode: DeliveryMode::default(),
            low_water_ratio: DEFAULT_LOW_WATER_RATIO,
        }
    }
}

impl FileConfig {
    /// Buffered amount below which the next batch may be sent.
    pub fn low_water_mark(&self) -> usize {
        let batch_bytes = self.chunk_size.max(1) * self.batch_size.max(1);
        (batch_bytes as f64 * self.low_water_ratio) as usize
    }

    /// Number of chunks a payload of `size` bytes is split into.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size.max(1) as u64)
    }
}

/// A file to send.
#[derive(Debug, Clone)]
pub struct FilePayload {
    /// File name announced to the receiver.
    pub name: String,
    /// MIME type announced to the receiver.
    pub mime_type: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl FilePayload {
    /// Create a payload from memory.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read a payload from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Io("path has no file name".into()))?
            .to_string();
        Ok(Self {
            mime_type: guess_mime_type(path),
            name,
            data,
        })
    }
}

fn guess_mime_type(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

/// A fully received file (accumulate mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Metadata from the request.
    pub metadata: FileMetadata,
    /// Assembled contents.
    pub data: Vec<u8>,
}

impl ReceivedFile {
    /// Write the file into `dir`, keeping only the final component of its name.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let name = Path::new(&self.metadata.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        let path = dir.as_ref().join(name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// Received data handed to [`FileHandler::on_receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDelivery {
    /// Emit mode: one chunk; an empty chunk marks the end of the file.
    Chunk(Vec<u8>),
    /// Accumulate mode: the whole file.
    File(ReceivedFile),
}

impl FileDelivery {
    /// Whether this is the zero-length terminal chunk of emit mode.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileDelivery::Chunk(chunk) if chunk.is_empty())
    }
}

/// How a send finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The receiver got every chunk.
    Delivered,
    /// The receiver declined the request.
    Declined,
}

/// Events of a [`FileConnection`].
pub trait FileHandler: Send + Sync {
    /// The peer wants to send a file. Accept or decline the request;
    /// dropping it declines.
    fn on_request(&self, remote: &Identity, request: FileRequest);

    /// Received data, according to the configured [`DeliveryMode`].
    fn on_receive(&self, remote: &Identity, delivery: FileDelivery);

    /// The peer declined our request.
    fn on_decline(&self, _remote: &Identity) {}

    /// The channel closed. Called exactly once.
    fn on_close(&self, remote: &Identity);
}

enum Reply {
    Accept(Option<ProgressFn>),
    Decline,
}

/// An incoming file request awaiting the owner's decision.
pub struct FileRequest {
    metadata: FileMetadata,
    reply: oneshot::Sender<Reply>,
}

impl FileRequest {
    /// What the peer wants to send.
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Accept and report receive progress to `progress`.
    pub fn accept(self, progress: impl Fn(f64) + Send + Sync + 'static) {
        let _ = self.reply.send(Reply::Accept(Some(Arc::new(progress))));
    }

    /// Accept without progress reporting.
    pub fn accept_quietly(self) {
        let _ = self.reply.send(Reply::Accept(None));
    }

    /// Decline the request.
    pub fn decline(self) {
        let _ = self.reply.send(Reply::Decline);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SendPhase {
    #[default]
    Idle,
    AwaitingAnswer,
    Transferring,
}

#[derive(Default)]
struct SendState {
    phase: SendPhase,
    answer: Option<oneshot::Sender<Decision>>,
    complete: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RecvPhase {
    #[default]
    Idle,
    AwaitingDecision,
    Transferring,
}

#[derive(Default)]
struct RecvState {
    phase: RecvPhase,
    metadata: Option<FileMetadata>,
    chunk_index: u64,
    bytes_received: u64,
    buffer: Vec<u8>,
    progress: Option<ProgressFn>,
    last_reported: u64,
}

/// Everything needed to finish a receive outside the state lock.
struct Completion {
    metadata: FileMetadata,
    buffer: Vec<u8>,
    bytes_received: u64,
    progress: Option<ProgressFn>,
    report_final: bool,
}

struct FileInner {
    channel: Arc<dyn PeerChannel>,
    handler: Arc<dyn FileHandler>,
    config: FileConfig,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// File transfer connection over one peer channel.
#[derive(Clone)]
pub struct FileConnection {
    inner: Arc<FileInner>,
}

impl FileConnection {
    /// Wrap an established channel and start reading from it.
    pub fn new(
        channel: Arc<dyn PeerChannel>,
        handler: Arc<dyn FileHandler>,
        config: FileConfig,
    ) -> Self {
        let inner = Arc::new(FileInner {
            channel,
            handler,
            config,
            send: Mutex::new(SendState::default()),
            recv: Mutex::new(RecvState::default()),
        });
        tokio::spawn(Arc::clone(&inner).read_loop());
        Self { inner }
    }

    /// Identity of the remote peer.
    pub fn remote(&self) -> &Identity {
        self.inner.channel.remote()
    }

    /// Whether a send is in progress.
    pub fn is_sending(&self) -> bool {
        lock(&self.inner.send).phase != SendPhase::Idle
    }

    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        self.inner.channel.is_open()
    }

    /// Send a file and wait until the receiver has all of it or declines.
    ///
    /// Fails immediately with [`Error::SendInProgress`] while another send
    /// runs; the running send is not affected. `progress` is called after
    /// each batch is handed to the channel.
    pub async fn send(&self, file: FilePayload, progress: Option<ProgressFn>) -> Result<SendOutcome> {
        let (answer_rx, complete_rx) = {
            let mut send = lock(&self.inner.send);
            if send.phase != SendPhase::Idle {
                return Err(Error::SendInProgress);
            }
            if !self.inner.channel.is_open() {
                return Err(Error::ChannelClosed);
            }
            let (answer_tx, answer_rx) = oneshot::channel();
            let (complete_tx, complete_rx) = oneshot::channel();
            send.phase = SendPhase::AwaitingAnswer;
            send.answer = Some(answer_tx);
            send.complete = Some(complete_tx);
            (answer_rx, complete_rx)
        };

        let _reset = SendReset(&self.inner);
        self.inner
            .run_send(file, progress, answer_rx, complete_rx)
            .await
    }

    /// Close the channel; the handler's `on_close` follows.
    pub async fn close(&self) {
        self.inner.channel.close().await;
    }
}

/// Returns the send side to Idle however `send` ends, including when the
/// future is dropped.
struct SendReset<'a>(&'a FileInner);

impl Drop for SendReset<'_> {
    fn drop(&mut self) {
        *lock(&self.0.send) = SendState::default();
    }
}

impl FileInner {
    fn remote(&self) -> &Identity {
        self.channel.remote()
    }

    async fn send_control(&self, control: FileControl) -> Result<()> {
        self.channel.send(PeerFrame::json(&control)?).await
    }

    async fn run_send(
        &self,
        file: FilePayload,
        progress: Option<ProgressFn>,
        answer_rx: oneshot::Receiver<Decision>,
        complete_rx: oneshot::Receiver<()>,
    ) -> Result<SendOutcome> {
        let chunk_size = self.config.chunk_size.max(1);
        let batch_size = self.config.batch_size.max(1);
        let size = file.data.len() as u64;
        let chunk_count = self.config.chunk_count(size);

        let metadata = FileMetadata {
            name: file.name,
            size,
            mime_type: file.mime_type,
            chunk_count,
        };
        info!(
            peer = %self.remote().redacted(),
            name = %metadata.name,
            size,
            chunk_count,
            "File request sent"
        );
        self.send_control(FileControl::request(metadata)).await?;

        let decision = answer_rx.await.map_err(|_| Error::ChannelClosed)?;
        if decision == Decision::Decline {
            info!(peer = %self.remote().redacted(), "File request declined");
            self.handler.on_decline(self.remote());
            return Ok(SendOutcome::Declined);
        }

        let low_water = self.config.low_water_mark();
        for (index, chunk) in file.data.chunks(chunk_size).enumerate() {
            if index > 0 && index % batch_size == 0 {
                self.channel.drained_below(low_water).await;
            }
            self.channel.send(PeerFrame::Binary(chunk.to_vec())).await?;

            let sent = index as u64 + 1;
            if sent % batch_size as u64 == 0 || sent == chunk_count {
                debug!(
                    peer = %self.remote().redacted(),
                    sent,
                    chunk_count,
                    buffered = self.channel.buffered_amount(),
                    "Batch handed to channel"
                );
                if let Some(progress) = &progress {
                    progress(sent as f64 / chunk_count as f64);
                }
            }
        }

        complete_rx.await.map_err(|_| Error::ChannelClosed)?;
        info!(peer = %self.remote().redacted(), size, "File delivered");
        Ok(SendOutcome::Delivered)
    }

    async fn read_loop(self: Arc<Self>) {
        while let Some(frame) = self.channel.recv().await {
            match frame {
                PeerFrame::Text(text) => match FileControl::parse(&text) {
                    Ok(control) => self.on_control(control),
                    Err(e) => debug!(peer = %self.remote().redacted(), error = %e, "Dropped malformed control frame"),
                },
                PeerFrame::Binary(chunk) => self.on_chunk(chunk).await,
            }
        }

        // Pending oneshots are dropped here, so a running send fails with ChannelClosed.
        *lock(&self.send) = SendState::default();
        *lock(&self.recv) = RecvState::default();
        self.channel.close().await;
        info!(peer = %self.remote().redacted(), "File connection closed");
        self.handler.on_close(self.remote());
    }

    fn on_control(self: &Arc<Self>, control: FileControl) {
        match control {
            FileControl::Request { data, .. } => self.on_request(data),
            FileControl::Answer { data, .. } => {
                let mut send = lock(&self.send);
                match send.answer.take() {
                    Some(answer) => {
                        if data == Decision::Accept {
                            send.phase = SendPhase::Transferring;
                        }
                        let _ = answer.send(data);
                    }
                    None => warn!(peer = %self.remote().redacted(), "Unexpected file answer"),
                }
            }
            FileControl::Complete { .. } => match lock(&self.send).complete.take() {
                Some(complete) => {
                    let _ = complete.send(());
                }
                None => warn!(peer = %self.remote().redacted(), "Unexpected file completion"),
            },
        }
    }

    fn on_request(self: &Arc<Self>, metadata: FileMetadata) {
        {
            let mut recv = lock(&self.recv);
            if recv.phase != RecvPhase::Idle {
                warn!(peer = %self.remote().redacted(), "File request while receiving, dropped");
                return;
            }
            recv.phase = RecvPhase::AwaitingDecision;
            recv.metadata = Some(metadata.clone());
        }

        info!(
            peer = %self.remote().redacted(),
            name = %metadata.name,
            size = metadata.size,
            "File request received"
        );
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).await_decision(reply_rx));
        self.handler.on_request(
            self.remote(),
            FileRequest {
                metadata,
                reply: reply_tx,
            },
        );
    }

    async fn await_decision(self: Arc<Self>, reply: oneshot::Receiver<Reply>) {
        match reply.await {
            Ok(Reply::Accept(progress)) => {
                let empty = {
                    let mut recv = lock(&self.recv);
                    if recv.phase != RecvPhase::AwaitingDecision {
                        return;
                    }
                    recv.phase = RecvPhase::Transferring;
                    recv.progress = progress;
                    recv.metadata.as_ref().map(|m| m.chunk_count == 0).unwrap_or(true)
                };
                if let Err(e) = self.send_control(FileControl::answer(Decision::Accept)).await {
                    debug!(error = %e, "Failed to send file answer");
                    return;
                }
                if empty {
                    let completion = self.take_completion();
                    if let Some(completion) = completion {
                        self.finish_receive(completion).await;
                    }
                }
            }
            _ => {
                *lock(&self.recv) = RecvState::default();
                if let Err(e) = self.send_control(FileControl::answer(Decision::Decline)).await {
                    debug!(error = %e, "Failed to send file answer");
                }
            }
        }
    }

    async fn on_chunk(&self, chunk: Vec<u8>) {
        let mode = self.config.mode;
        let every = self.config.progress_every.max(1);

        let (emitted, report, progress, completion) = {
            let mut recv = lock(&self.recv);
            if recv.phase != RecvPhase::Transferring {
                debug!(chunk = %RedactedBytes(&chunk), "Dropped chunk outside a transfer");
                return;
            }
            let chunk_count = recv.metadata.as_ref().map(|m| m.chunk_count).unwrap_or(0);

            recv.chunk_index += 1;
            recv.bytes_received += chunk.len() as u64;
            let emitted = match mode {
                DeliveryMode::Emit => Some(chunk),
                DeliveryMode::Accumulate => {
                    recv.buffer.extend_from_slice(&chunk);
                    None
                }
            };

            let index = recv.chunk_index;
            let report = if index % every == 0 && chunk_count > 0 {
                recv.last_reported = index;
                Some(index as f64 / chunk_count as f64)
            } else {
                None
            };
            let progress = recv.progress.clone();
            drop(recv);

            let completion = if index >= chunk_count {
                self.take_completion()
            } else {
                None
            };
            (emitted, report, progress, completion)
        };

        if let Some(chunk) = emitted {
            self.handler.on_receive(self.remote(), FileDelivery::Chunk(chunk));
        }
        if let (Some(progress), Some(fraction)) = (&progress, report) {
            progress(fraction);
        }
        if let Some(completion) = completion {
            self.finish_receive(completion).await;
        }
    }

    /// Reset the receive side and hand back what is needed to deliver.
    fn take_completion(&self) -> Option<Completion> {
        let recv = std::mem::take(&mut *lock(&self.recv));
        let metadata = recv.metadata?;
        Some(Completion {
            report_final: recv.last_reported != metadata.chunk_count,
            metadata,
            buffer: recv.buffer,
            bytes_received: recv.bytes_received,
            progress: recv.progress,
        })
    }

    async fn finish_receive(&self, completion: Completion) {
        let Completion {
            metadata,
            buffer,
            bytes_received,
            progress,
            report_final,
        } = completion;

        if bytes_received != metadata.size {
            warn!(
                peer = %self.remote().redacted(),
                expected = metadata.size,
                received = bytes_received,
                "File size mismatch"
            );
        }
        if let (Some(progress), true) = (&progress, report_final) {
            progress(1.0);
        }

        info!(
            peer = %self.remote().redacted(),
            name = %metadata.name,
            size = bytes_received,
            "File received"
        );
        let delivery = match self.config.mode {
            DeliveryMode::Emit => FileDelivery::Chunk(Vec::new()),
            DeliveryMode::Accumulate => FileDelivery::File(ReceivedFile {
                metadata,
                data: buffer,
            }),
        };
        self.handler.on_receive(self.remote(), delivery);

        if let Err(e) = self.send_control(FileControl::complete()).await {
            debug!(error = %e, "Failed to send file completion");
        }
    }
}
