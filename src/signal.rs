use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::room::User;

/// Wire envelope for every signaling frame, in both directions.
/// `data` is itself a JSON document appropriate to the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event: String,
    pub data: String,
}

/// Payload of the `id` event, sent once right after admission.
#[derive(Debug, Serialize)]
pub struct IdPayload {
    pub id: Uuid,
    pub users: Vec<User>,
}

/// Payload of the `user_states_updated` event.
#[derive(Debug, Serialize)]
pub struct RosterPayload {
    pub users: Vec<User>,
}

#[derive(Debug)]
pub enum SignalError {
    /// The underlying channel has been torn down.
    ChannelClosed,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::ChannelClosed => write!(f, "signaling channel closed"),
        }
    }
}

impl std::error::Error for SignalError {}

/// The write half of a signaling channel.
#[async_trait]
pub trait SignalTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
}

#[async_trait]
impl SignalTransport for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(Message::text(text)).await.map_err(Into::into)
    }
}

/// Serializes outbound signaling messages on one peer channel. Writes are
/// atomic at the message level; the single reader is unguarded by
/// construction.
pub struct SignalSender {
    writer: Mutex<Box<dyn SignalTransport>>,
}

impl SignalSender {
    pub fn new(transport: impl SignalTransport + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(transport)),
        }
    }

    /// Sends one `{event, data}` frame.
    pub async fn write(&self, event: &str, data: String) -> Result<(), SignalError> {
        let frame = match serde_json::to_string(&WsMessage {
            event: event.to_string(),
            data,
        }) {
            Ok(frame) => frame,
            Err(_) => return Err(SignalError::ChannelClosed),
        };
        let mut writer = self.writer.lock().await;
        writer
            .send_text(frame)
            .await
            .map_err(|_| SignalError::ChannelClosed)
    }
}

/// Test transport that hands decoded frames to an in-process channel.
#[cfg(test)]
pub(crate) struct ChannelTransport(pub tokio::sync::mpsc::UnboundedSender<WsMessage>);

#[cfg(test)]
#[async_trait]
impl SignalTransport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        let msg: WsMessage = serde_json::from_str(&text)?;
        self.0
            .send(msg)
            .map_err(|_| anyhow::anyhow!("receiver dropped"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_envelope_shape() {
        let msg = WsMessage {
            event: "offer".to_string(),
            data: r#"{"type":"offer","sdp":"v=0"}"#.to_string(),
        };
        let raw = serde_json::to_string(&msg).unwrap();
        let parsed: WsMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.event, "offer");
        assert_eq!(parsed.data, msg.data);
    }

    #[tokio::test]
    async fn test_writes_are_delivered_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = SignalSender::new(ChannelTransport(tx));

        for i in 0..10 {
            sender
                .write("candidate", format!("{{\"seq\":{}}}", i))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.event, "candidate");
            assert_eq!(msg.data, format!("{{\"seq\":{}}}", i));
        }
    }

    #[tokio::test]
    async fn test_write_fails_when_channel_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SignalSender::new(ChannelTransport(tx));
        drop(rx);

        let err = sender.write("offer", "{}".to_string()).await.unwrap_err();
        assert!(matches!(err, SignalError::ChannelClosed));
    }
}
