//! Call control sub-protocol.
//!
//! Control messages travel as messaging envelopes (`{d: ...}`) on the call's
//! channel:
//!
//! | Message                              | Meaning                     |
//! |--------------------------------------|-----------------------------|
//! | `{type:"request", data}`             | caller offers a call        |
//! | `{type:"answer", data:"accept"}`     | callee's decision           |
//! | `{type:"end"}`                       | hang up                     |
//! | `{signal:true, peerData}`            | track added/removed mid-call|
//!
//! Media itself is carried by the channel implementation; this layer tracks
//! which tracks each side has attached and relays the renegotiation.
//!
//! `end()` never notifies the local handler. Only the side receiving `end`
//! gets `on_end`, and channel loss always yields exactly one `on_close`.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{
    CallCommand, CallControl, Decision, Envelope, MediaTrack, PeerFrame, TrackOp, TrackSignal,
};
use crate::transport::PeerChannel;

/// Phase of a call connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    /// No call.
    #[default]
    Idle,
    /// We called and wait for the answer.
    AwaitingAnswer,
    /// We were called and the owner has not decided yet.
    AwaitingDecision,
    /// Call established.
    InCall,
}

/// A set of media tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStream {
    /// Stream id.
    pub id: String,
    /// Attached tracks.
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Builder-style track attachment.
    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.tracks.push(track);
        self
    }

    fn insert(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    fn remove(&mut self, track_id: &str) -> Option<MediaTrack> {
        let index = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(index))
    }
}

/// How a placed call finished its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Callee accepted; the call is in progress.
    Accepted,
    /// Callee declined.
    Declined,
}

/// Events of a [`CallConnection`].
pub trait CallHandler: Send + Sync {
    /// The peer is calling. Accept with a local stream or decline;
    /// dropping the request declines.
    fn on_request(&self, remote: &Identity, request: CallRequest);

    /// The peer declined our call.
    fn on_decline(&self, _remote: &Identity) {}

    /// The peer attached a track.
    fn on_track(&self, _remote: &Identity, _track: &MediaTrack) {}

    /// The peer detached a track.
    fn on_track_removed(&self, _remote: &Identity, _track: &MediaTrack) {}

    /// The peer ended the call.
    fn on_end(&self, remote: &Identity);

    /// The channel closed. Called exactly once.
    fn on_close(&self, remote: &Identity);
}

enum CallReply {
    Accept(MediaStream),
    Decline,
}

/// An incoming call awaiting the owner's decision.
pub struct CallRequest {
    data: Value,
    reply: oneshot::Sender<CallReply>,
}

impl CallRequest {
    /// Offer metadata chosen by the caller.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Accept, attaching `stream` to the call.
    pub fn accept(self, stream: MediaStream) {
        let _ = self.reply.send(CallReply::Accept(stream));
    }

    /// Decline the call.
    pub fn decline(self) {
        let _ = self.reply.send(CallReply::Decline);
    }
}

#[derive(Default)]
struct CallState {
    phase: CallPhase,
    local: Option<MediaStream>,
    remote: MediaStream,
    answer: Option<oneshot::Sender<Decision>>,
}

impl CallState {
    fn reset(&mut self) {
        self.phase = CallPhase::Idle;
        self.local = None;
        self.remote.tracks.clear();
        self.answer = None;
    }
}

struct CallInner {
    channel: Arc<dyn PeerChannel>,
    handler: Arc<dyn CallHandler>,
    state: Mutex<CallState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Call control connection over one peer channel.
#[derive(Clone)]
pub struct CallConnection {
    inner: Arc<CallInner>,
}

impl CallConnection {
    /// Wrap an established channel and start reading from it.
    pub fn new(channel: Arc<dyn PeerChannel>, handler: Arc<dyn CallHandler>) -> Self {
        let remote = MediaStream::new(channel.remote().as_str());
        let inner = Arc::new(CallInner {
            channel,
            handler,
            state: Mutex::new(CallState {
                remote,
                ..CallState::default()
            }),
        });
        tokio::spawn(Arc::clone(&inner).read_loop());
        Self { inner }
    }

    /// Identity of the remote peer.
    pub fn remote(&self) -> &Identity {
        self.inner.channel.remote()
    }

    /// Current phase.
    pub fn phase(&self) -> CallPhase {
        lock(&self.inner.state).phase
    }

    /// Whether a call is established.
    pub fn is_in_call(&self) -> bool {
        self.phase() == CallPhase::InCall
    }

    /// Tracks we attached to the current call.
    pub fn local_stream(&self) -> Option<MediaStream> {
        lock(&self.inner.state).local.clone()
    }

    /// Tracks the peer attached to the current call.
    pub fn remote_stream(&self) -> MediaStream {
        lock(&self.inner.state).remote.clone()
    }

    /// Place a call and wait for the callee's decision.
    ///
    /// Fails with [`Error::CallInProgress`] unless idle.
    pub async fn call(&self, stream: MediaStream, data: Value) -> Result<CallOutcome> {
        let answer_rx = {
            let mut state = lock(&self.inner.state);
            if state.phase != CallPhase::Idle {
                return Err(Error::CallInProgress);
            }
            if !self.inner.channel.is_open() {
                return Err(Error::ChannelClosed);
            }
            let (answer_tx, answer_rx) = oneshot::channel();
            state.phase = CallPhase::AwaitingAnswer;
            state.local = Some(stream);
            state.answer = Some(answer_tx);
            answer_rx
        };

        info!(peer = %self.remote().redacted(), "Placing call");
        let request = CallControl::Command(CallCommand::Request { data });
        if let Err(e) = self.inner.send_control(&request).await {
            lock(&self.inner.state).reset();
            return Err(e);
        }

        match answer_rx.await {
            Ok(Decision::Accept) => {
                info!(peer = %self.remote().redacted(), "Call accepted");
                self.inner.announce_local_tracks().await;
                Ok(CallOutcome::Accepted)
            }
            Ok(Decision::Decline) => {
                info!(peer = %self.remote().redacted(), "Call declined");
                lock(&self.inner.state).reset();
                self.inner.handler.on_decline(self.remote());
                Ok(CallOutcome::Declined)
            }
            Err(_) if self.inner.channel.is_open() => {
                Err(Error::InvalidState("call ended before an answer".into()))
            }
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Hang up. Idempotent and infallible; the local handler gets no `on_end`.
    pub async fn end(&self) {
        let was_active = {
            let mut state = lock(&self.inner.state);
            let active = state.phase != CallPhase::Idle;
            state.reset();
            active
        };
        if !was_active {
            return;
        }

        info!(peer = %self.remote().redacted(), "Ending call");
        if let Err(e) = self
            .inner
            .send_control(&CallControl::Command(CallCommand::End))
            .await
        {
            debug!(error = %e, "Could not deliver call end");
        }
    }

    /// Attach a track mid-call and renegotiate.
    pub async fn add_track(&self, track: MediaTrack) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.phase != CallPhase::InCall {
                return Err(Error::InvalidState("not in a call".into()));
            }
            let local = state.local.get_or_insert_with(MediaStream::default);
            if !local.insert(track.clone()) {
                return Ok(());
            }
        }
        self.inner
            .send_control(&CallControl::signal(TrackOp::Add, track))
            .await
    }

    /// Detach a track mid-call and renegotiate.
    pub async fn remove_track(&self, track_id: &str) -> Result<()> {
        let track = {
            let mut state = lock(&self.inner.state);
            if state.phase != CallPhase::InCall {
                return Err(Error::InvalidState("not in a call".into()));
            }
            match state.local.as_mut().and_then(|local| local.remove(track_id)) {
                Some(track) => track,
                None => return Ok(()),
            }
        };
        self.inner
            .send_control(&CallControl::signal(TrackOp::Remove, track))
            .await
    }

    /// Close the channel; the handler's `on_close` follows.
    pub async fn close(&self) {
        self.inner.channel.close().await;
    }
}

impl CallInner {
    fn remote(&self) -> &Identity {
        self.channel.remote()
    }

    async fn send_control(&self, control: &CallControl) -> Result<()> {
        self.channel.send(PeerFrame::json(&Envelope::new(control))?).await
    }

    async fn announce_local_tracks(&self) {
        let tracks = lock(&self.state)
            .local
            .as_ref()
            .map(|s| s.tracks.clone())
            .unwrap_or_default();
        for track in tracks {
            if let Err(e) = self.send_control(&CallControl::signal(TrackOp::Add, track)).await {
                debug!(error = %e, "Could not announce track");
                return;
            }
        }
    }

    async fn read_loop(self: Arc<Self>) {
        while let Some(frame) = self.channel.recv().await {
            let text = match frame {
                PeerFrame::Text(text) => text,
                PeerFrame::Binary(data) => {
                    debug!(len = data.len(), "Dropped binary frame on call channel");
                    continue;
                }
            };
            match serde_json::from_str::<Envelope<CallControl>>(&text) {
                Ok(envelope) => self.on_control(envelope.d).await,
                Err(e) => debug!(peer = %self.remote().redacted(), error = %e, "Dropped malformed call frame"),
            }
        }

        lock(&self.state).reset();
        self.channel.close().await;
        info!(peer = %self.remote().redacted(), "Call connection closed");
        self.handler.on_close(self.remote());
    }

    async fn on_control(self: &Arc<Self>, control: CallControl) {
        match control {
            CallControl::Command(CallCommand::Request { data }) => self.on_request(data).await,
            CallControl::Command(CallCommand::Answer { data }) => {
                let mut state = lock(&self.state);
                match state.answer.take() {
                    Some(answer) => {
                        if data == Decision::Accept {
                            state.phase = CallPhase::InCall;
                        }
                        let _ = answer.send(data);
                    }
                    None => warn!(peer = %self.remote().redacted(), "Unexpected call answer"),
                }
            }
            CallControl::Command(CallCommand::End) => {
                let was_active = {
                    let mut state = lock(&self.state);
                    let active = state.phase != CallPhase::Idle;
                    state.reset();
                    active
                };
                if was_active {
                    info!(peer = %self.remote().redacted(), "Call ended by peer");
                    self.handler.on_end(self.remote());
                }
            }
            CallControl::Signal { peer_data, .. } => self.on_track_signal(peer_data),
        }
    }

    async fn on_request(self: &Arc<Self>, data: Value) {
        let busy = {
            let mut state = lock(&self.state);
            if state.phase != CallPhase::Idle {
                true
            } else {
                state.phase = CallPhase::AwaitingDecision;
                false
            }
        };
        if busy {
            warn!(peer = %self.remote().redacted(), "Call request while busy, declining");
            let decline = CallControl::Command(CallCommand::Answer {
                data: Decision::Decline,
            });
            if let Err(e) = self.send_control(&decline).await {
                debug!(error = %e, "Could not decline call");
            }
            return;
        }

        info!(peer = %self.remote().redacted(), "Incoming call");
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).await_decision(reply_rx));
        self.handler.on_request(
            self.remote(),
            CallRequest {
                data,
                reply: reply_tx,
            },
        );
    }

    async fn await_decision(self: Arc<Self>, reply: oneshot::Receiver<CallReply>) {
        let decision = match reply.await {
            Ok(CallReply::Accept(stream)) => {
                let mut state = lock(&self.state);
                if state.phase != CallPhase::AwaitingDecision {
                    return;
                }
                state.phase = CallPhase::InCall;
                state.local = Some(stream);
                Decision::Accept
            }
            _ => {
                let mut state = lock(&self.state);
                if state.phase != CallPhase::AwaitingDecision {
                    return;
                }
                state.reset();
                Decision::Decline
            }
        };

        let answer = CallControl::Command(CallCommand::Answer { data: decision });
        if let Err(e) = self.send_control(&answer).await {
            debug!(error = %e, "Could not answer call");
            return;
        }
        if decision == Decision::Accept {
            self.announce_local_tracks().await;
        }
    }

    fn on_track_signal(&self, signal: TrackSignal) {
        let changed = {
            let mut state = lock(&self.state);
            if state.phase != CallPhase::InCall {
                debug!(peer = %self.remote().redacted(), "Dropped track signal outside a call");
                return;
            }
            match signal.op {
                TrackOp::Add => state.remote.insert(signal.track.clone()),
                TrackOp::Remove => state.remote.remove(&signal.track.id).is_some(),
            }
        };
        if !changed {
            return;
        }
        match signal.op {
            TrackOp::Add => self.handler.on_track(self.remote(), &signal.track),
            TrackOp::Remove => self.handler.on_track_removed(self.remote(), &signal.track),
        }
    }
}
