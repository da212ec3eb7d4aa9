//! Credential-token validation.
//!
//! Token issuance lives in the platform's auth service; this side only
//! verifies signatures and expiry. The `role` claim is advisory: the identity
//! resolver may override it when the profile turns up in another collection.

use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    config::JwtConfig,
    error::{AppError, AppResult},
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Auth-account ID (not a profile ID).
    pub sub: String,
    /// Claimed role; one of Admin / HR / Employee in any casing.
    pub role: String,
    pub iss: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthService {
    config: JwtConfig,
}

impl AuthService {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AppError::TokenExpired,
            _ => AppError::InvalidToken,
        })?;

        Ok(data.claims)
    }
}
