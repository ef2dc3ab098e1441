//! Gateway error types.

use thiserror::Error;

/// Token verification failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token's `exp` has passed.
    #[error("Token has expired")]
    TokenExpired,

    /// Not a parseable token, or the signature does not match the secret.
    #[error("Invalid token format: {0}")]
    TokenMalformed(String),

    /// Signature is valid but the claims do not carry an identity.
    #[error("Invalid token claims: {0}")]
    ClaimsInvalid(String),

    /// No verification secret configured. Fatal for the process.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl AuthError {
    /// Message reported to the client before the connection is closed.
    pub fn client_message(&self) -> &'static str {
        match self {
            AuthError::TokenExpired => "Token has expired",
            AuthError::TokenMalformed(_) => "Invalid token format",
            AuthError::ClaimsInvalid(_) | AuthError::ConfigurationError(_) => {
                "An error occurred while verifying the token"
            }
        }
    }
}

/// Failure to hand a message to the client's writer task.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The client connection is gone.
    #[error("Client channel closed")]
    Closed,

    /// The client is not draining its buffer.
    #[error("Client channel full")]
    Full,
}

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Authentication error.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Client transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(AuthError::TokenExpired.client_message(), "Token has expired");
        assert_eq!(
            AuthError::TokenMalformed("InvalidSignature".into()).client_message(),
            "Invalid token format"
        );
        assert_eq!(
            AuthError::ClaimsInvalid("missing field `email`".into()).client_message(),
            "An error occurred while verifying the token"
        );
    }
}
