//! Messaging sub-protocol.
//!
//! Each message is one text frame `{d: <json>}`. Nothing else is stateful.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::{Envelope, PeerFrame};
use crate::transport::PeerChannel;

/// Events of a [`MessageConnection`].
pub trait MessageHandler: Send + Sync {
    /// A message arrived.
    fn on_data(&self, remote: &Identity, data: Value);

    /// The channel closed. Called exactly once.
    fn on_close(&self, remote: &Identity);
}

/// Messaging connection over one peer channel.
#[derive(Clone)]
pub struct MessageConnection {
    channel: Arc<dyn PeerChannel>,
}

impl MessageConnection {
    /// Wrap an established channel and start reading from it.
    pub fn new(channel: Arc<dyn PeerChannel>, handler: Arc<dyn MessageHandler>) -> Self {
        tokio::spawn(read_loop(Arc::clone(&channel), handler));
        Self { channel }
    }

    /// Identity of the remote peer.
    pub fn remote(&self) -> &Identity {
        self.channel.remote()
    }

    /// Send one JSON message.
    pub async fn send(&self, message: Value) -> Result<()> {
        let frame = PeerFrame::json(&Envelope::new(message))?;
        self.channel.send(frame).await
    }

    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Close the channel; the handler's `on_close` follows.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

async fn read_loop(channel: Arc<dyn PeerChannel>, handler: Arc<dyn MessageHandler>) {
    let remote = channel.remote().clone();
    while let Some(frame) = channel.recv().await {
        match frame {
            PeerFrame::Text(text) => match serde_json::from_str::<Envelope<Value>>(&text) {
                Ok(envelope) => handler.on_data(&remote, envelope.d),
                Err(e) => debug!(peer = %remote.redacted(), error = %e, "Dropped malformed message"),
            },
            PeerFrame::Binary(data) => {
                debug!(peer = %remote.redacted(), len = data.len(), "Dropped binary frame on message channel")
            }
        }
    }
    channel.close().await;
    handler.on_close(&remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Data(Value),
        Close,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl MessageHandler for Recorder {
        fn on_data(&self, _remote: &Identity, data: Value) {
            let _ = self.0.send(Event::Data(data));
        }

        fn on_close(&self, _remote: &Identity) {
            let _ = self.0.send(Event::Close);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("recorder alive")
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (a, b) = MemoryChannel::pair("alice", "bob");
        let (handler_a, mut events_a) = recorder();
        let (handler_b, mut events_b) = recorder();
        let alice = MessageConnection::new(Arc::new(a), handler_a);
        let bob = MessageConnection::new(Arc::new(b), handler_b);

        alice.send(json!({"text": "hello"})).await.unwrap();
        assert_eq!(next(&mut events_b).await, Event::Data(json!({"text": "hello"})));

        bob.send(json!("hi back")).await.unwrap();
        assert_eq!(next(&mut events_a).await, Event::Data(json!("hi back")));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (a, b) = MemoryChannel::pair("alice", "bob");
        let (handler_b, mut events_b) = recorder();
        let a: Arc<dyn PeerChannel> = Arc::new(a);
        let _bob = MessageConnection::new(Arc::new(b), handler_b);

        a.send(PeerFrame::Text("not json".into())).await.unwrap();
        a.send(PeerFrame::Binary(vec![1, 2])).await.unwrap();
        a.send(PeerFrame::Text(r#"{"d":42}"#.into())).await.unwrap();

        assert_eq!(next(&mut events_b).await, Event::Data(json!(42)));
    }

    #[tokio::test]
    async fn test_close_notifies_both_sides_once() {
        let (a, b) = MemoryChannel::pair("alice", "bob");
        let (handler_a, mut events_a) = recorder();
        let (handler_b, mut events_b) = recorder();
        let alice = MessageConnection::new(Arc::new(a), handler_a);
        let _bob = MessageConnection::new(Arc::new(b), handler_b);

        alice.close().await;
        alice.close().await;
        assert_eq!(next(&mut events_a).await, Event::Close);
        assert_eq!(next(&mut events_b).await, Event::Close);
        assert!(!alice.is_open());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_a.try_recv().is_err());
    }
}
