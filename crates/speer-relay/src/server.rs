//! HTTP and websocket surface of the relay.
//!
//! ```text
//! GET /signal      websocket  -> SignalingRelay
//! GET /pusher      websocket  -> Hub
//! GET /onlines     json       -> friends currently connected
//! GET /online/:id  json       -> bool, 403 unless friends
//! ```
//!
//! Every route resolves the `speer` session cookie first; without a valid
//! session the request fails with 401 and no socket is created.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info};

use speer_core::protocol::NOT_FRIEND;
use speer_core::Identity;

use crate::auth::{session_from_cookie, FriendshipGate, SessionResolver};
use crate::config::RelayConfig;
use crate::group::GroupSessions;
use crate::hub::Hub;
use crate::presence::{online_friends, PresenceFanout};
use crate::registry::{ConnectionRegistry, Outbound};
use crate::signaling::SignalingRelay;

/// Shared state of a relay server.
pub struct AppState {
    /// Signal forwarding over the relay registry.
    pub relay: SignalingRelay,
    /// Event hub over its own registry.
    pub hub: Arc<Hub>,
    /// Session cookie resolution.
    pub sessions: Arc<dyn SessionResolver>,
    /// Friendship checks.
    pub gate: Arc<dyn FriendshipGate>,
}

impl AppState {
    /// Wire registries, hub, presence fan-out and relay together.
    pub fn new(
        config: &RelayConfig,
        sessions: Arc<dyn SessionResolver>,
        gate: Arc<dyn FriendshipGate>,
    ) -> Arc<Self> {
        let hub = Arc::new(Hub::new(Arc::new(ConnectionRegistry::new("hub"))));
        let presence = Arc::new(PresenceFanout::new(Arc::clone(&hub), Arc::clone(&gate)));
        let registry = Arc::new(ConnectionRegistry::new("relay").with_presence(presence));
        let groups = Arc::new(GroupSessions::new(config.group_ttl));
        Arc::new(Self {
            relay: SignalingRelay::new(registry, Arc::clone(&gate), groups),
            hub,
            sessions,
            gate,
        })
    }

    /// Start liveness probing of both registries and group expiry.
    pub fn spawn_maintenance(&self, config: &RelayConfig) -> Vec<JoinHandle<()>> {
        vec![
            self.relay.registry().spawn_heartbeat(config.heartbeat_interval),
            self.hub.registry().spawn_heartbeat(config.heartbeat_interval),
            self.relay.groups().spawn_cleanup(config.group_ttl),
        ]
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Option<Identity> {
        let credential = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(session_from_cookie)?;
        self.sessions.resolve(credential).await
    }
}

/// Build the relay router.
pub fn router(state: Arc<AppState>, config: &RelayConfig) -> Router {
    let cors = match &config.allowed_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin.clone()))
            .allow_credentials(true),
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods([Method::GET, Method::OPTIONS])
    .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/signal", get(signal_ws))
        .route("/pusher", get(pusher_ws))
        .route("/onlines", get(onlines))
        .route("/online/:id", get(online))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Relay,
    Hub,
}

impl Endpoint {
    fn registry<'a>(&self, state: &'a AppState) -> &'a Arc<ConnectionRegistry> {
        match self {
            Endpoint::Relay => state.relay.registry(),
            Endpoint::Hub => state.hub.registry(),
        }
    }
}

async fn signal_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, headers, ws, Endpoint::Relay).await
}

async fn pusher_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, headers, ws, Endpoint::Hub).await
}

async fn upgrade(
    state: Arc<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    endpoint: Endpoint,
) -> Response {
    let Some(identity) = state.authenticate(&headers).await else {
        debug!(?endpoint, "Refused unauthenticated upgrade");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| serve_socket(state, endpoint, identity, socket))
}

async fn serve_socket(state: Arc<AppState>, endpoint: Endpoint, identity: Identity, socket: WebSocket) {
    let registry = Arc::clone(endpoint.registry(&state));
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let me = registry.register(identity.clone(), tx).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Terminate) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => match endpoint {
                    Endpoint::Relay => state.relay.handle_inbound_frame(&me, &text).await,
                    Endpoint::Hub => state.hub.handle_frame(&me, &text).await,
                },
                Some(Ok(Message::Pong(_))) => registry.mark_alive(&identity, me.socket_id).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer = %identity.redacted(), error = %e, "Socket error");
                    break;
                }
            },
        }
    }

    match endpoint {
        Endpoint::Relay => {
            registry.remove(&identity, me.socket_id).await;
        }
        Endpoint::Hub => state.hub.disconnect(&identity, me.socket_id).await,
    }
    info!(?endpoint, peer = %identity.redacted(), socket_id = me.socket_id, "Socket closed");
}

async fn onlines(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(identity) = state.authenticate(&headers).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let friends = online_friends(state.relay.registry(), state.gate.as_ref(), &identity).await;
    Json(friends).into_response()
}

async fn online(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(identity) = state.authenticate(&headers).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let target = Identity::new(id);
    if !state.gate.authorize_signal(&identity, &target).await {
        return (StatusCode::FORBIDDEN, Json(json!({"error": NOT_FRIEND}))).into_response();
    }
    Json(state.relay.registry().is_online(&target).await).into_response()
}
