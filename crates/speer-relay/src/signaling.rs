//! Signaling relay.
//!
//! Forwards negotiation signals between authenticated sockets. The relay
//! never interprets `peerData`; it only stamps the sender and checks that
//! sender and recipient are friends, once per signal.
//!
//! | Situation                  | Result                                   |
//! |----------------------------|------------------------------------------|
//! | recipient offline          | dropped silently                         |
//! | not friends                | `{error:"Not friend", remoteId}` to sender |
//! | friends                    | `{action:"signal", remoteId:<sender>, ...}` to recipient |
//! | group answer from outsider | `{error:"Not in group"}` to sender        |

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use speer_core::logging::sanitize_for_log;
use speer_core::protocol::{
    ClientFrame, ErrorFrame, ForwardedSignal, GroupRequest, ServerFrame, SignalFrame, SubProtocol,
    NOT_FRIEND, NOT_IN_GROUP,
};
use speer_core::Identity;

use crate::auth::FriendshipGate;
use crate::group::{generate_group_id, GroupSessions, Validation};
use crate::registry::{ConnectionRegistry, SocketRef};

/// Relay frame handling over the relay's connection registry.
pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
    gate: Arc<dyn FriendshipGate>,
    groups: Arc<GroupSessions>,
}

impl SignalingRelay {
    /// Create a relay.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gate: Arc<dyn FriendshipGate>,
        groups: Arc<GroupSessions>,
    ) -> Self {
        Self {
            registry,
            gate,
            groups,
        }
    }

    /// The relay's connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open group signaling sessions.
    pub fn groups(&self) -> &Arc<GroupSessions> {
        &self.groups
    }

    /// Handle one text frame from `sender`'s relay socket.
    pub async fn handle_inbound_frame(&self, sender: &SocketRef, text: &str) {
        let signal = match ClientFrame::parse(text) {
            Ok(ClientFrame::Signal(signal)) => signal,
            Ok(_) => {
                debug!(peer = %sender.identity.redacted(), "Ignored hub frame on relay socket");
                return;
            }
            Err(e) => {
                warn!(
                    peer = %sender.identity.redacted(),
                    error = %e,
                    frame = %sanitize_for_log(text),
                    "Dropped malformed relay frame"
                );
                return;
            }
        };

        match signal.kind {
            SubProtocol::Group => self.handle_group(sender, signal).await,
            _ => self.forward(sender, signal).await,
        }
    }

    async fn forward(&self, sender: &SocketRef, signal: SignalFrame) {
        let Some(recipient) = self.registry.lookup(&signal.remote_id).await else {
            debug!(
                from = %sender.identity.redacted(),
                to = %signal.remote_id.redacted(),
                "Recipient offline, signal dropped"
            );
            return;
        };

        if !self.gate.authorize_signal(&sender.identity, &signal.remote_id).await {
            info!(
                from = %sender.identity.redacted(),
                to = %signal.remote_id.redacted(),
                "Signal refused, not friends"
            );
            reply_error(sender, NOT_FRIEND, Some(signal.remote_id));
            return;
        }

        debug!(
            from = %sender.identity.redacted(),
            to = %signal.remote_id.redacted(),
            kind = signal.kind.as_str(),
            "Forwarding signal"
        );
        let frame = ForwardedSignal::from_sender(sender.identity.clone(), signal);
        recipient.send_frame(&ServerFrame::Signal(frame));
    }

    async fn handle_group(&self, sender: &SocketRef, signal: SignalFrame) {
        let request: GroupRequest = match serde_json::from_value(signal.data.unwrap_or(Value::Null)) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %sender.identity.redacted(), error = %e, "Dropped malformed group signal");
                return;
            }
        };

        if let Some(group_id) = &request.group_id {
            match self
                .groups
                .validate(group_id, &sender.identity, signal.peer_data.clone())
                .await
            {
                // An answer for a session that expired or never existed.
                Validation::UnknownGroup if request.members.is_empty() => {
                    debug!(peer = %sender.identity.redacted(), "Group answer without open session");
                    reply_error(sender, NOT_IN_GROUP, None);
                    return;
                }
                Validation::UnknownGroup => {}
                Validation::NotMember => {
                    reply_error(sender, NOT_IN_GROUP, None);
                    return;
                }
                Validation::Pending { .. } => return,
                Validation::Complete { initiator, payloads } => {
                    let data = json!({"groupId": group_id, "members": payloads});
                    let frame = ForwardedSignal::group(None, Value::Null, data);
                    if !self.registry.send_to(&initiator, &ServerFrame::Signal(frame)).await {
                        debug!(peer = %initiator.redacted(), "Group initiator offline at completion");
                    }
                    return;
                }
            }
        }

        self.open_group(sender, request, signal.peer_data).await;
    }

    async fn open_group(&self, sender: &SocketRef, request: GroupRequest, peer_data: Value) {
        let mut members: Vec<Identity> = Vec::new();
        for member in request.members {
            if member != sender.identity && !members.contains(&member) {
                members.push(member);
            }
        }

        for member in &members {
            if !self.gate.authorize_signal(&sender.identity, member).await {
                reply_error(sender, NOT_FRIEND, Some(member.clone()));
                return;
            }
        }

        let group_id = request.group_id.unwrap_or_else(generate_group_id);
        self.groups
            .create(&group_id, sender.identity.clone(), &members)
            .await;

        let data = json!({"groupId": group_id, "members": members});
        sender.send_frame(&ServerFrame::Signal(ForwardedSignal::group(
            None,
            Value::Null,
            data.clone(),
        )));

        let invitation = ServerFrame::Signal(ForwardedSignal::group(
            Some(sender.identity.clone()),
            peer_data,
            data,
        ));
        for member in &members {
            self.registry.send_to(member, &invitation).await;
        }
    }
}

fn reply_error(sender: &SocketRef, error: &str, remote_id: Option<Identity>) {
    sender.send_frame(&ServerFrame::Error(ErrorFrame {
        error: error.to_string(),
        remote_id,
    }));
}
