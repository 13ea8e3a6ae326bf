//! Frames exchanged over an established peer channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::PROTOCOL_VERSION;

/// One message on a peer channel.
///
/// The channel preserves the kind of every frame: control traffic is always
/// `Text`, bulk data is always `Binary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    /// JSON control message.
    Text(String),
    /// Raw data chunk.
    Binary(Vec<u8>),
}

impl PeerFrame {
    /// Payload length in bytes, used for buffered-amount accounting.
    pub fn len(&self) -> usize {
        match self {
            PeerFrame::Text(text) => text.len(),
            PeerFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode a JSON control message as a text frame.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(PeerFrame::Text(serde_json::to_string(value)?))
    }
}

/// Messaging envelope: `{d: message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Wrapped message.
    pub d: T,
}

impl<T> Envelope<T> {
    /// Wrap a message.
    pub fn new(d: T) -> Self {
        Self { d }
    }
}

/// Accept/decline answer used by file and call handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Go ahead.
    Accept,
    /// Refuse.
    Decline,
}

/// Metadata announced by a file request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
    /// Number of chunks that will follow an accept.
    pub chunk_count: u64,
}

/// File-transfer control frame. Every variant carries the `speer` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileControl {
    /// Sender asks to transfer a file.
    Request {
        /// Protocol marker.
        speer: u8,
        /// What is about to be sent.
        data: FileMetadata,
    },
    /// Receiver's decision.
    Answer {
        /// Protocol marker.
        speer: u8,
        /// Accept or decline.
        data: Decision,
    },
    /// Receiver got every chunk.
    Complete {
        /// Protocol marker.
        speer: u8,
    },
}

impl FileControl {
    /// Build a request frame.
    pub fn request(metadata: FileMetadata) -> Self {
        FileControl::Request {
            speer: PROTOCOL_VERSION,
            data: metadata,
        }
    }

    /// Build an answer frame.
    pub fn answer(decision: Decision) -> Self {
        FileControl::Answer {
            speer: PROTOCOL_VERSION,
            data: decision,
        }
    }

    /// Build a completion frame.
    pub fn complete() -> Self {
        FileControl::Complete {
            speer: PROTOCOL_VERSION,
        }
    }

    /// Parse a control frame, rejecting frames without the protocol marker.
    pub fn parse(text: &str) -> Result<Self> {
        let control: FileControl =
            serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))?;
        let marker = match &control {
            FileControl::Request { speer, .. }
            | FileControl::Answer { speer, .. }
            | FileControl::Complete { speer } => *speer,
        };
        if marker != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!("unknown file protocol marker: {}", marker)));
        }
        Ok(control)
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio.
    Audio,
    /// Camera video.
    Video,
    /// Screen share.
    Screen,
}

/// A media track attached to a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Track id, unique within its stream.
    pub id: String,
    /// Track kind.
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Create a track.
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// Track change announced through renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOp {
    /// Track was attached.
    Add,
    /// Track was detached.
    Remove,
}

/// Renegotiation payload for one track change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSignal {
    /// What changed.
    pub op: TrackOp,
    /// The track concerned.
    pub track: MediaTrack,
}

/// Call handshake command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallCommand {
    /// Caller offers a call.
    Request {
        /// Offer metadata chosen by the caller.
        #[serde(default)]
        data: Value,
    },
    /// Callee's decision.
    Answer {
        /// Accept or decline.
        data: Decision,
    },
    /// Either side hangs up.
    End,
}

/// Any message on a call control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallControl {
    /// Renegotiation for a track change: `{signal: true, peerData}`.
    #[serde(rename_all = "camelCase")]
    Signal {
        /// Always `true`.
        signal: bool,
        /// Track change.
        peer_data: TrackSignal,
    },
    /// Handshake command.
    Command(CallCommand),
}

impl CallControl {
    /// Build a renegotiation message.
    pub fn signal(op: TrackOp, track: MediaTrack) -> Self {
        CallControl::Signal {
            signal: true,
            peer_data: TrackSignal { op, track },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_request_wire_shape() {
        let frame = FileControl::request(FileMetadata {
            name: "photo.jpg".into(),
            size: 200_000,
            mime_type: "image/jpeg".into(),
            chunk_count: 4,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "speer": 1,
                "data": {"name": "photo.jpg", "size": 200000, "mimeType": "image/jpeg", "chunkCount": 4}
            })
        );
    }

    #[test]
    fn test_file_control_requires_marker() {
        assert!(FileControl::parse(r#"{"type":"answer","speer":1,"data":"accept"}"#).is_ok());
        assert!(FileControl::parse(r#"{"type":"answer","speer":7,"data":"accept"}"#).is_err());
        assert!(FileControl::parse(r#"{"type":"answer","data":"accept"}"#).is_err());
        assert!(FileControl::parse(r#"{"d":"hello"}"#).is_err());
    }

    #[test]
    fn test_call_control_shapes() {
        let end: CallControl = serde_json::from_value(json!({"type": "end"})).unwrap();
        assert_eq!(end, CallControl::Command(CallCommand::End));

        let answer: CallControl =
            serde_json::from_value(json!({"type": "answer", "data": "decline"})).unwrap();
        assert_eq!(
            answer,
            CallControl::Command(CallCommand::Answer { data: Decision::Decline })
        );

        let signal = CallControl::signal(TrackOp::Add, MediaTrack::new("cam", TrackKind::Video));
        let value = serde_json::to_value(Envelope::new(&signal)).unwrap();
        assert_eq!(
            value,
            json!({"d": {"signal": true, "peerData": {"op": "add", "track": {"id": "cam", "kind": "video"}}}})
        );
        let back: Envelope<CallControl> = serde_json::from_value(value).unwrap();
        assert_eq!(back.d, signal);
    }
}
