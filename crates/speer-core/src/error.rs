//! Error types for Speer.
//!
//! Relay-level errors stay local to one hop. Transport-level errors
//! terminate the owning connection and are never retried here.

use thiserror::Error;

/// Core error type for Speer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The relay refused to forward a signal to this peer.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The session credential did not resolve to an identity.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The underlying peer channel or relay socket closed or failed.
    #[error("channel closed")]
    ChannelClosed,

    /// Malformed or unexpected frame.
    /// Dropped and logged, never fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A file send was attempted while another one is still running.
    #[error("Sending in progress")]
    SendInProgress,

    /// A call was placed while the connection is not idle.
    #[error("Call in progress")]
    CallInProgress,

    /// A negotiation with the same remote identity is still pending.
    #[error("negotiation in progress")]
    NegotiationInProgress,

    /// Operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Relay websocket or peer socket error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(String),

    /// Identity directory could not be loaded.
    #[error("directory error: {0}")]
    Directory(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using Speer's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error should only drop the offending frame.
    /// Malformed input never tears down a connection.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Encoding(_))
    }

    /// Check if this error is fatal to the connection that produced it.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Error::ChannelClosed | Error::Connection(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::http::StatusCode;
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ChannelClosed,
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                Error::Unauthenticated
            }
            other => Error::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_classification() {
        assert!(Error::Protocol("bad frame".into()).should_silent_drop());
        assert!(Error::Encoding("eof".into()).should_silent_drop());
        assert!(!Error::ChannelClosed.should_silent_drop());
        assert!(!Error::SendInProgress.should_silent_drop());
    }

    #[test]
    fn test_concurrent_send_message() {
        assert_eq!(Error::SendInProgress.to_string(), "Sending in progress");
    }
}
