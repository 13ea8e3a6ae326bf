//! # Speer Relay
//!
//! Always-on server that lets two friends exchange negotiation signals
//! before they talk directly. It keeps one socket per identity, forwards
//! signals only between friends, and publishes presence events on a hub.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │   server (axum: /signal /pusher /online*)     │
//! ├──────────────────────┬────────────────────────┤
//! │ signaling + group    │ hub + presence         │
//! ├──────────────────────┴────────────────────────┤
//! │   registry (one socket per identity)  │ auth  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The relay persists nothing and never reads negotiation payloads.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod auth;
pub mod config;
pub mod group;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod server;
pub mod signaling;

pub use config::RelayConfig;
pub use server::{router, AppState};
