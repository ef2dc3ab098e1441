//! WebSocket handler trait for upstream feed dialects.

use crate::error::Result;
use crate::messages::{CommandKind, ProductId};

/// Trait that feed dialects implement to translate between the connector
/// and a concrete upstream protocol.
///
/// The connector owns the socket; a handler only encodes outgoing commands
/// and decodes incoming text frames.
pub trait WsHandler: Send + Sync + 'static {
    /// Event type produced from upstream payloads.
    type Event: Send + 'static;

    /// Returns the WebSocket URL to connect to.
    fn url(&self) -> &str;

    /// Encode a subscription command into a text frame.
    fn encode_command(
        &self,
        kind: CommandKind,
        products: &[ProductId],
        request_id: u64,
    ) -> Result<String>;

    /// Decode a text frame. Payloads the dialect does not recognise
    /// (heartbeats, command replies, other event kinds) yield `None`.
    fn decode(&self, text: &str) -> Option<Self::Event>;
}
