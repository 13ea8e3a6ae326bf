//! # Speer Core Library
//!
//! Client side of the Speer peer-to-peer system: two authenticated friends
//! exchange negotiation signals through a relay, then talk over a direct
//! peer channel with no further server involvement.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   connection: message │ file │ call          │
//! ├──────────────────────────────────────────────┤
//! │   negotiator (offer/answer via the relay)    │
//! ├──────────────────────┬───────────────────────┤
//! │   transport (peer    │   client (relay       │
//! │   channel backends)  │   websocket)          │
//! ├──────────────────────┴───────────────────────┤
//! │   protocol (wire frames)  │  identity        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Each established peer channel carries exactly one sub-protocol, chosen at
//! negotiation time and fixed for the channel's lifetime.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod connection;
pub mod error;
pub mod identity;
pub mod logging;
pub mod negotiator;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
pub use identity::Identity;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker carried by every file-transfer control frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Name of the session cookie presented to the relay.
pub const SESSION_COOKIE: &str = "speer";
