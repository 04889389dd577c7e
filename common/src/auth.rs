// JWT token handling for WebSocket identities and admin callers

use crate::errors::AuthError;
use crate::models::UserClaims;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Permission required by the administrative HTTP surface
pub const ADMIN_PERMISSION: &str = "scheduler:admin";

/// JWT token service for encoding and decoding tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    expiration_hours: i64,
}

impl JwtService {
    #[instrument(skip(secret))]
    pub fn new(secret: &str, expiration_hours: u64) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            expiration_hours: expiration_hours as i64,
        }
    }

    /// Issue a token for `identity`
    #[instrument(skip(self))]
    pub fn encode_token(
        &self,
        identity: &str,
        permissions: Vec<String>,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = UserClaims {
            sub: identity.to_string(),
            permissions,
            exp: (now + Duration::hours(self.expiration_hours)).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            error!(error = %e, "Failed to encode JWT token");
            AuthError::AuthenticationFailed(format!("Failed to encode token: {}", e))
        })
    }

    /// Decode and validate a token, including its expiry
    #[instrument(skip(self, token))]
    pub fn decode_token(&self, token: &str) -> Result<UserClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let token_data =
            decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                debug!(error = %e, "Rejected JWT token");
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    _ => AuthError::InvalidToken(format!("Token validation failed: {}", e)),
                }
            })?;

        Ok(token_data.claims)
    }
}

/// Check a decoded caller for one permission
pub fn require_permission(claims: &UserClaims, permission: &str) -> Result<(), AuthError> {
    if claims.permissions.iter().any(|p| p == permission) {
        Ok(())
    } else {
        Err(AuthError::InsufficientPermissions(permission.to_string()))
    }
}
