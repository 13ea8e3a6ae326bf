//! Presence fan-out and queries.
//!
//! When an identity gains or loses its relay socket, its friends subscribed
//! to `login`/`logout` on the hub are told. Presence queries read the relay
//! registry through the friendship gate.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use speer_core::Identity;

use crate::auth::FriendshipGate;
use crate::hub::Hub;
use crate::registry::{ConnectionRegistry, PresenceListener};

/// Hub topic announcing that a friend came online.
pub const LOGIN_EVENT: &str = "login";

/// Hub topic announcing that a friend went offline.
pub const LOGOUT_EVENT: &str = "logout";

/// Announces relay presence changes to friends through the hub.
pub struct PresenceFanout {
    hub: Arc<Hub>,
    gate: Arc<dyn FriendshipGate>,
}

impl PresenceFanout {
    /// Create a fan-out publishing on `hub`.
    pub fn new(hub: Arc<Hub>, gate: Arc<dyn FriendshipGate>) -> Self {
        Self { hub, gate }
    }
}

#[async_trait]
impl PresenceListener for PresenceFanout {
    async fn on_presence_change(&self, identity: &Identity, online: bool) {
        let friends = self.gate.friends_of(identity).await;
        if friends.is_empty() {
            return;
        }
        let topic = if online { LOGIN_EVENT } else { LOGOUT_EVENT };
        let data = Value::String(identity.to_string());
        let delivered = self.hub.dispatch(topic, data, Some(&friends), None).await;
        debug!(peer = %identity.redacted(), topic, delivered, "Presence announced");
    }
}

/// Friends of `identity` that currently hold a relay socket.
pub async fn online_friends(
    registry: &ConnectionRegistry,
    gate: &dyn FriendshipGate,
    identity: &Identity,
) -> Vec<Identity> {
    let live = registry.list_live_identities().await;
    gate.friends_of(identity)
        .await
        .into_iter()
        .filter(|friend| live.contains(friend))
        .collect()
}
