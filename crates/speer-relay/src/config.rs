//! Relay server configuration.

use axum::http::HeaderValue;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Default liveness probe period. A silent socket is evicted after two.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default lifetime of an unfinished group signaling session.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(60);

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind.
    pub listen: String,
    /// Liveness probe period for relay and hub sockets.
    pub heartbeat_interval: Duration,
    /// Group sessions older than this are discarded.
    pub group_ttl: Duration,
    /// Single origin allowed to make credentialed requests; any origin when unset.
    pub allowed_origin: Option<HeaderValue>,
}

impl RelayConfig {
    /// Configuration with default timings.
    pub fn new() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            group_ttl: DEFAULT_GROUP_TTL,
            allowed_origin: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}
