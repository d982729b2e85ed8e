//! Session token issuing and verification.
//!
//! Tokens are HS256-signed JWTs that carry only the user identity. Roles and
//! permissions are never embedded; they are resolved fresh on every request.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

const INVALID_TOKEN: &str = "invalid or expired token";

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: i64,
    pub email: String,
}

/// Issued token with its expiry, as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    /// Issue a token for the given user, valid for the configured window.
    pub fn issue(&self, user_id: i64, email: &str) -> Result<IssuedToken> {
        self.issue_at(user_id, email, Utc::now())
    }

    fn issue_at(&self, user_id: i64, email: &str, now: DateTime<Utc>) -> Result<IssuedToken> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatekeeperError::Token(format!("Failed to sign token: {}", e)))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature and expiry. Never touches storage.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Token verification failed");
            GatekeeperError::Unauthorized(INVALID_TOKEN.to_string())
        })?;

        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| GatekeeperError::Unauthorized(INVALID_TOKEN.to_string()))?;

        Ok(VerifiedIdentity {
            user_id,
            email: data.claims.email,
        })
    }
}
