//! Bearer token verification.
//!
//! Tokens are HMAC-signed JWTs carrying `{userId, email, exp}`, the format the
//! credential service issues on sign-in. Verification is a pure function of
//! the token, the shared secret and the clock.

use crate::error::AuthError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Deserializer, Serialize};

/// Default lifetime of issued tokens.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    /// `None` for tokens issued without an expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Token claims as issued by the credential service.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "userId", deserialize_with = "string_or_number")]
    user_id: String,
    email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// User ids may be issued as numbers or strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Verifies (and, for the credential flow and tests, issues) bearer tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for the shared secret.
    ///
    /// A blank secret is a [`AuthError::ConfigurationError`].
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::ConfigurationError(
                "token verification secret is not set".to_string(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // Expiry is checked against an explicit clock in `verify_at`.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Verify a token against the system clock.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token as of `now`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::TokenMalformed(e.to_string()))?;

        let claims: Claims = serde_json::from_value(data.claims)
            .map_err(|e| AuthError::ClaimsInvalid(e.to_string()))?;

        if let Some(exp) = claims.exp {
            if now.timestamp() >= exp {
                return Err(AuthError::TokenExpired);
            }
        }

        let expires_at = match claims.exp {
            Some(exp) => Some(
                Utc.timestamp_opt(exp, 0)
                    .single()
                    .ok_or_else(|| AuthError::ClaimsInvalid(format!("exp out of range: {}", exp)))?,
            ),
            None => None,
        };

        Ok(Identity {
            user_id: claims.user_id,
            email: claims.email,
            expires_at,
        })
    }

    /// Issue an HS256 token valid for [`DEFAULT_TOKEN_TTL_HOURS`] from now.
    pub fn issue(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        self.issue_at(
            user_id,
            email,
            Utc::now(),
            Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
        )
    }

    /// Issue an HS256 token as of `issued_at`.
    pub fn issue_at(
        &self,
        user_id: &str,
        email: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.to_string(),
            email: email.to_string(),
            iat: Some(issued_at.timestamp()),
            exp: Some((issued_at + ttl).timestamp()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::ConfigurationError(e.to_string()))
    }
}

/// Extract the token from an `authorization` header value.
///
/// Accepts a bare token or `Bearer <token>`. Only a blank value yields
/// `None`; anything else (a lone scheme included) is left for
/// [`TokenVerifier::verify`] to reject.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let value = header_value.trim();
    if value.is_empty() {
        return None;
    }
    match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => Some(rest.trim()),
        _ => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(SECRET).unwrap()
    }

    #[test]
    fn test_blank_secret_is_configuration_error() {
        assert!(matches!(
            TokenVerifier::new("  "),
            Err(AuthError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = verifier();
        let issued_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let token = verifier
            .issue_at("42", "trader@example.com", issued_at, Duration::hours(24))
            .unwrap();

        let identity = verifier
            .verify_at(&token, issued_at + Duration::hours(1))
            .unwrap();
        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.email, "trader@example.com");
        assert_eq!(identity.expires_at, Some(issued_at + Duration::hours(24)));
    }

    #[test]
    fn test_expired_token() {
        let verifier = verifier();
        let issued_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let token = verifier
            .issue_at("42", "trader@example.com", issued_at, Duration::hours(1))
            .unwrap();

        let exp = issued_at + Duration::hours(1);
        assert!(verifier.verify_at(&token, exp - Duration::seconds(1)).is_ok());
        assert_eq!(
            verifier.verify_at(&token, exp),
            Err(AuthError::TokenExpired)
        );
    }

    #[test]
    fn test_wrong_secret_is_malformed() {
        let other = TokenVerifier::new("another-secret").unwrap();
        let token = other.issue("42", "trader@example.com").unwrap();
        assert!(matches!(
            verifier().verify(&token),
            Err(AuthError::TokenMalformed(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            verifier().verify("not-a-jwt"),
            Err(AuthError::TokenMalformed(_))
        ));
    }

    #[test]
    fn test_numeric_user_id_and_hs512() {
        let claims = serde_json::json!({
            "userId": 7,
            "email": "n@example.com",
            "exp": Utc::now().timestamp() + 3600,
        });
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let identity = verifier().verify(&token).unwrap();
        assert_eq!(identity.user_id, "7");
    }

    #[test]
    fn test_missing_identity_claims() {
        let claims = serde_json::json!({ "userId": 7 });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            verifier().verify(&token),
            Err(AuthError::ClaimsInvalid(_))
        ));
    }

    #[test]
    fn test_token_without_expiry() {
        let claims = serde_json::json!({ "userId": "u1", "email": "a@b.c" });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let identity = verifier().verify(&token).unwrap();
        assert_eq!(identity.expires_at, None);
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer  abc"), Some("abc"));
        assert_eq!(bearer_token("   "), None);
        assert_eq!(bearer_token(""), None);
    }

    #[test]
    fn test_lone_scheme_is_a_malformed_token() {
        assert_eq!(bearer_token("Bearer"), Some("Bearer"));
        assert_eq!(bearer_token("Bearer "), Some("Bearer"));

        let token = bearer_token("Bearer").unwrap();
        assert!(matches!(
            verifier().verify(token),
            Err(AuthError::TokenMalformed(_))
        ));
    }

    #[test]
    fn test_issue_uses_default_ttl() {
        let verifier = verifier();
        let before = Utc::now();
        let token = verifier.issue("42", "trader@example.com").unwrap();

        let expires_at = verifier.verify(&token).unwrap().expires_at.unwrap();
        let ttl = Duration::hours(DEFAULT_TOKEN_TTL_HOURS);
        assert!(expires_at >= before + ttl - Duration::seconds(1));
        assert!(expires_at <= Utc::now() + ttl);
    }
}
