//! Sub-protocols layered on an established peer channel.
//!
//! - [`message`]: JSON messages wrapped as `{d: ...}`
//! - [`file`]: chunked file transfer with request/accept/decline handshake
//! - [`call`]: call control and track renegotiation
//!
//! Every connection owns its channel exclusively and spawns one reader task.
//! Owners receive events through handler traits supplied at construction.

pub mod call;
pub mod file;
pub mod message;

pub use call::{CallConnection, CallHandler, CallOutcome, CallPhase, CallRequest, MediaStream};
pub use file::{
    DeliveryMode, FileConfig, FileConnection, FileDelivery, FileHandler, FilePayload,
    FileRequest, ProgressFn, ReceivedFile, SendOutcome,
};
pub use message::{MessageConnection, MessageHandler};

use crate::identity::Identity;
use crate::protocol::SubProtocol;

/// An established connection of any sub-protocol.
#[derive(Clone)]
pub enum Connection {
    /// Plain messaging.
    Message(MessageConnection),
    /// File transfer.
    File(FileConnection),
    /// Call control.
    Call(CallConnection),
}

impl Connection {
    /// Identity of the remote peer.
    pub fn remote(&self) -> &Identity {
        match self {
            Connection::Message(c) => c.remote(),
            Connection::File(c) => c.remote(),
            Connection::Call(c) => c.remote(),
        }
    }

    /// Sub-protocol negotiated for this connection.
    pub fn sub_protocol(&self) -> SubProtocol {
        match self {
            Connection::Message(_) => SubProtocol::Basic,
            Connection::File(_) => SubProtocol::Binary,
            Connection::Call(_) => SubProtocol::Call,
        }
    }

    /// Close the underlying channel.
    pub async fn close(&self) {
        match self {
            Connection::Message(c) => c.close().await,
            Connection::File(c) => c.close().await,
            Connection::Call(c) => c.close().await,
        }
    }
}
