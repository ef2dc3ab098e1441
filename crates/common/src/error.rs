//! Error types for upstream feed connections.

use thiserror::Error;

/// Errors raised by an upstream feed connection.
///
/// `NotReady` and `Send` are per-command outcomes the caller reports and
/// recovers from; `Connect` and `Protocol` end the connection.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Upstream connection is not open")]
    NotReady,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
