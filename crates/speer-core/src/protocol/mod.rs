//! Wire formats for Speer.
//!
//! Two distinct wires:
//!
//! - **Relay frames**: JSON text messages on the websocket between a client
//!   and the relay (signals, errors, hub events).
//! - **Peer frames**: kind-tagged frames on an established peer channel.
//!   Text frames carry JSON control messages, binary frames carry file data,
//!   so the two never have to be told apart by sniffing bytes.
//!
//! ## Peer frame encoding on stream transports
//!
//! ```text
//! ┌─────────┬──────────┬───────────────────┐
//! │  Kind   │  Length  │     Payload       │
//! │ (1 byte)│ (4 bytes)│   (variable)      │
//! └─────────┴──────────┴───────────────────┘
//! ```
//!
//! Maximum payload size: 1 MiB

mod frame;
mod peer;
mod relay;

pub use frame::{FrameHeader, FrameKind, FrameReader, HEADER_SIZE, MAX_FRAME_SIZE};
pub use peer::{
    CallCommand, CallControl, Decision, Envelope, FileControl, FileMetadata,
    MediaTrack, PeerFrame, TrackKind, TrackOp, TrackSignal,
};
pub use relay::{
    ClientFrame, ErrorFrame, EventFrame, ForwardedSignal, GroupRequest, ServerFrame, SignalFrame,
    SubProtocol, NOT_FRIEND, NOT_IN_GROUP,
};
