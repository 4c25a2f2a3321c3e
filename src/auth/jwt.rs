// src/auth/jwt.rs

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use anyhow::{Result, anyhow};

use super::{IdentityVerifier, VerifiedIdentity};

/// Default `IdentityVerifier` (§6.6): HMAC-signed JWT, same claim shape
/// as `Claims` below. Verification only — this type never issues a token.
pub struct JwtIdentityVerifier {
    secret: String,
}

impl JwtIdentityVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let claims = decode::<Claims>(token, &key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| anyhow!("invalid bearer token: {e}"))?;
        Ok(VerifiedIdentity {
            participant_id: claims.sub,
            display_name: claims.username,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // user_id
    pub username: String,
    pub exp: usize,         // expiration timestamp
    pub iat: usize,         // issued at timestamp
}
