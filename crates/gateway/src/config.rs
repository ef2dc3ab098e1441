//! Gateway configuration from environment variables.

use crate::error::{GatewayError, Result};
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3003;
/// Default Prometheus exporter port.
pub const DEFAULT_METRICS_PORT: u16 = 9093;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared secret for bearer token verification (`JWT_SECRET`).
    pub jwt_secret: String,
    /// Upstream feed WebSocket URL (`SOCKET_CONNECTION_URL`).
    pub upstream_url: String,
    /// HTTP/WebSocket listen port (`PORT`).
    pub port: u16,
    /// Prometheus exporter port (`METRICS_PORT`).
    pub metrics_port: u16,
    /// Upstream handshake timeout (`UPSTREAM_CONNECT_TIMEOUT_SECS`).
    pub upstream_connect_timeout: Duration,
    /// Keepalive ping interval for both legs (`PING_INTERVAL_SECS`).
    pub ping_interval: Duration,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GatewayError::Config(format!("{} must be set", key)))
        };
        let parsed = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| GatewayError::Config(format!("{} must be a number, got {:?}", key, raw))),
                None => Ok(default),
            }
        };

        let port = parsed("PORT", DEFAULT_PORT as u64)?;
        let metrics_port = parsed("METRICS_PORT", DEFAULT_METRICS_PORT as u64)?;

        Ok(Self {
            jwt_secret: required("JWT_SECRET")?,
            upstream_url: required("SOCKET_CONNECTION_URL")?,
            port: u16::try_from(port)
                .map_err(|_| GatewayError::Config(format!("PORT out of range: {}", port)))?,
            metrics_port: u16::try_from(metrics_port).map_err(|_| {
                GatewayError::Config(format!("METRICS_PORT out of range: {}", metrics_port))
            })?,
            upstream_connect_timeout: Duration::from_secs(parsed(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                10,
            )?),
            ping_interval: Duration::from_secs(parsed("PING_INTERVAL_SECS", 30)?),
        })
    }
}
