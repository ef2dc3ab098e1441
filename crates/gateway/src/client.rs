//! Outbound channel to a connected client.

use crate::error::{Result, TransportError};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default buffer size for client message channels.
/// Sized for ~1 second of high-frequency updates at 1000 msgs/sec.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Sending half of a client's writer task.
///
/// Sends never block: a client that stops draining its buffer loses
/// messages instead of stalling its session.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    tx: mpsc::Sender<Message>,
}

impl ClientChannel {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Serialize and queue a protocol message.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.send_raw(Message::Text(json.into()))?;
        Ok(())
    }

    /// Queue a raw WebSocket frame.
    pub fn send_raw(&self, msg: Message) -> std::result::Result<(), TransportError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
