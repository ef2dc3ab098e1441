//! WebSocket protocol message types.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use common::ProductId;
use market_feed::TickerEvent;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to ticker streams.
    Subscribe(ChannelRequest),
    /// Unsubscribe from ticker streams.
    Unsubscribe(ChannelRequest),
    /// Ping message for keepalive.
    Ping,
}

/// Payload of subscribe / unsubscribe requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRequest {
    /// Upstream method name sent by clients ("SUBSCRIBE" / "UNSUBSCRIBE").
    /// Informational only: the event name decides the command.
    #[serde(rename = "type", default)]
    pub method: Option<String>,
    /// Products (upstream stream names) to act on.
    pub channels: Vec<ProductId>,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Operational acknowledgement or terminal auth failure.
    ConnectionResponse(ConnectionResponse),
    /// A trade on a subscribed product.
    Ticker(TickerEvent),
    /// Pong response to ping.
    Pong,
}

/// Outcome kind of a connection response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Success,
    Error,
}

/// `connection-response` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    /// Tells the client to discard its credential and sign in again.
    pub is_token_expire: bool,
    pub message: String,
}

impl ConnectionResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Success,
            is_token_expire: false,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            is_token_expire: false,
            message: message.into(),
        }
    }

    /// Authentication failure; the connection is closed after sending it.
    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            is_token_expire: true,
            message: message.into(),
        }
    }
}

impl From<ConnectionResponse> for ServerMessage {
    fn from(response: ConnectionResponse) -> Self {
        ServerMessage::ConnectionResponse(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let raw = r#"{"event":"subscribe","data":{"type":"SUBSCRIBE","channels":["btcusdt@trade"]}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::Subscribe(req) => {
                assert_eq!(req.method.as_deref(), Some("SUBSCRIBE"));
                assert_eq!(req.channels, vec!["btcusdt@trade".to_string()]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unsubscribe_without_type() {
        let raw = r#"{"event":"unsubscribe","data":{"channels":["a","b"]}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::Unsubscribe(req) => {
                assert!(req.method.is_none());
                assert_eq!(req.channels.len(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_and_reject_unknown() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"event":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"trade","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"subscribe","data":{}}"#).is_err());
    }

    #[test]
    fn test_serialize_connection_response() {
        let msg: ServerMessage = ConnectionResponse::auth_failure("Token has expired").into();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "connection-response");
        assert_eq!(json["data"]["type"], "error");
        assert_eq!(json["data"]["is_token_expire"], true);
        assert_eq!(json["data"]["message"], "Token has expired");

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"event": "pong"}));
    }
}
