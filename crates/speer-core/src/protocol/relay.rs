//! Frames exchanged between clients and the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Error text sent when the sender may not signal the addressed identity.
pub const NOT_FRIEND: &str = "Not friend";

/// Error text sent when a group signal comes from a non-member.
pub const NOT_IN_GROUP: &str = "Not in group";

/// Sub-protocol a negotiation is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubProtocol {
    /// Plain JSON messaging.
    Basic,
    /// Chunked file transfer.
    Binary,
    /// Call control and track renegotiation.
    Call,
    /// Multi-party group setup (relay-side session).
    Group,
}

impl SubProtocol {
    /// Wire name of the sub-protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubProtocol::Basic => "basic",
            SubProtocol::Binary => "binary",
            SubProtocol::Call => "call",
            SubProtocol::Group => "group",
        }
    }
}

/// Signal sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFrame {
    /// Addressed recipient.
    pub remote_id: Identity,
    /// Sub-protocol of the negotiation.
    #[serde(rename = "type")]
    pub kind: SubProtocol,
    /// Opaque negotiation payload.
    #[serde(default)]
    pub peer_data: Value,
    /// Auxiliary data (group id and members for group signals).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any frame a client sends to the relay or the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Hub: start receiving an event topic.
    Subscribe {
        /// Topic name.
        event: String,
    },
    /// Hub: stop receiving an event topic.
    Unsubscribe {
        /// Topic name.
        event: String,
    },
    /// Relay: forward a negotiation signal.
    Signal(SignalFrame),
}

impl ClientFrame {
    /// Parse a text frame received from a client.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Encode as a websocket text payload.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Signal forwarded by the relay, with the sender stamped server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedSignal {
    /// Always `"signal"`.
    pub action: String,
    /// Sender identity. Absent on group completion frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<Identity>,
    /// Sub-protocol of the negotiation.
    #[serde(rename = "type")]
    pub kind: SubProtocol,
    /// Opaque negotiation payload.
    #[serde(default)]
    pub peer_data: Value,
    /// Auxiliary data.
    #[serde(default)]
    pub data: Value,
}

impl ForwardedSignal {
    /// Build the frame delivered to the recipient of `frame`.
    pub fn from_sender(sender: Identity, frame: SignalFrame) -> Self {
        Self {
            action: "signal".to_string(),
            remote_id: Some(sender),
            kind: frame.kind,
            peer_data: frame.peer_data,
            data: frame.data.unwrap_or(Value::Null),
        }
    }

    /// Build a group frame carrying only auxiliary data.
    pub fn group(remote_id: Option<Identity>, peer_data: Value, data: Value) -> Self {
        Self {
            action: "signal".to_string(),
            remote_id,
            kind: SubProtocol::Group,
            peer_data,
            data,
        }
    }
}

/// Error reported by the relay to the sender of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    /// Human-readable error identifier (`"Not friend"`, `"Not in group"`).
    pub error: String,
    /// Identity the failed frame was addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<Identity>,
}

/// Event dispatched by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Topic name.
    pub event: String,
    /// Event payload, possibly transformed per recipient.
    #[serde(default)]
    pub data: Value,
}

/// Any frame the relay or hub sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Relay error.
    Error(ErrorFrame),
    /// Hub event.
    Event(EventFrame),
    /// Forwarded signal.
    Signal(ForwardedSignal),
}

impl ServerFrame {
    /// Parse a text frame received from the relay.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Encode as a websocket text payload.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Auxiliary data of a group signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    /// Group session id; generated by the relay when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Members expected to validate (first frame only).
    #[serde(default)]
    pub members: Vec<Identity>,
}
