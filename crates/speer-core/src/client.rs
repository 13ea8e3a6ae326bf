//! Relay websocket client.
//!
//! A client keeps one websocket to the relay's signaling endpoint and one to
//! the hub endpoint. Both authenticate with the session cookie and share the
//! same framing, so this module serves both:
//!
//! ```text
//!   RelayClient ──send_frame──▶ writer task ──▶ websocket
//!   RelayInbound::run ◀── websocket  ──▶ FrameHandler (Negotiator, EventSubscriptions)
//! ```

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logging::Redacted;
use crate::negotiator::SignalSink;
use crate::protocol::{ClientFrame, ServerFrame, SignalFrame};
use crate::SESSION_COOKIE;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Consumer of frames arriving from the relay or the hub.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// A frame arrived.
    async fn handle_frame(&self, frame: ServerFrame);

    /// The websocket closed.
    async fn on_close(&self) {}
}

/// Sending half of a relay or hub connection.
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<Message>,
}

/// Receiving half of a relay or hub connection.
pub struct RelayInbound {
    read: SplitStream<WsStream>,
}

impl RelayClient {
    /// Connect to `url` presenting `session` as the session cookie.
    pub async fn connect(url: &str, session: &str) -> Result<(Arc<Self>, RelayInbound)> {
        let mut request = url.into_client_request()?;
        let cookie = HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, session))
            .map_err(|e| Error::Connection(format!("invalid session: {}", e)))?;
        request.headers_mut().insert(COOKIE, cookie);

        let (stream, _response) = connect_async(request).await?;
        info!(url = %url, session = %Redacted(session), "Connected to relay");

        let (write, read) = stream.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write, queue));

        Ok((Arc::new(Self { outbound }), RelayInbound { read }))
    }

    /// Queue a frame for the relay.
    pub fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let text = frame.to_text()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Whether the writer is still running.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Close the websocket.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

#[async_trait]
impl SignalSink for RelayClient {
    async fn send_signal(&self, frame: SignalFrame) -> Result<()> {
        self.send_frame(&ClientFrame::Signal(frame))
    }
}

impl RelayInbound {
    /// Feed every inbound frame to `handler` until the websocket closes.
    pub async fn run(mut self, handler: Arc<dyn FrameHandler>) {
        while let Some(message) = self.read.next().await {
            match message {
                Ok(Message::Text(text)) => match ServerFrame::parse(&text) {
                    Ok(frame) => handler.handle_frame(frame).await,
                    Err(e) if e.should_silent_drop() => {
                        debug!(error = %e, "Dropped malformed relay frame")
                    }
                    Err(e) => {
                        warn!(error = %e, "Relay frame rejected");
                        break;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Relay connection failed");
                    break;
                }
            }
        }
        info!("Relay connection closed");
        handler.on_close().await;
    }
}

async fn write_loop(mut write: SplitSink<WsStream, Message>, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = write.send(message).await {
            debug!(error = %e, "Relay write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Callback invoked with the data of a hub event.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Client side of the broadcast hub: one callback per subscribed topic.
pub struct EventSubscriptions {
    client: Arc<RelayClient>,
    callbacks: RwLock<HashMap<String, EventCallback>>,
}

impl EventSubscriptions {
    /// Track subscriptions made through `client`, a hub connection.
    pub fn new(client: Arc<RelayClient>) -> Self {
        Self {
            client,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to `event`, replacing any earlier callback for it.
    pub async fn subscribe(
        &self,
        event: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<()> {
        self.callbacks
            .write()
            .await
            .insert(event.to_string(), Arc::new(callback));
        self.client.send_frame(&ClientFrame::Subscribe {
            event: event.to_string(),
        })
    }

    /// Stop receiving `event`.
    pub async fn unsubscribe(&self, event: &str) -> Result<()> {
        self.callbacks.write().await.remove(event);
        self.client.send_frame(&ClientFrame::Unsubscribe {
            event: event.to_string(),
        })
    }

    /// Topics currently subscribed.
    pub async fn topics(&self) -> Vec<String> {
        self.callbacks.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl FrameHandler for EventSubscriptions {
    async fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Event(event) => {
                let callback = self.callbacks.read().await.get(&event.event).cloned();
                match callback {
                    Some(callback) => callback(event.data),
                    None => debug!(event = %event.event, "Event without subscription"),
                }
            }
            other => debug!(frame = ?other, "Ignored non-event frame on hub connection"),
        }
    }
}
