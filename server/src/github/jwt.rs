use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConnectionError;

/// Backdated to tolerate clock drift between us and GitHub
const ISSUED_AT_SKEW_SECS: i64 = 60;
/// GitHub refuses App JWTs valid for longer than ten minutes
const LIFETIME_SECS: i64 = 600;

#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Signs short-lived RS256 tokens that authenticate as the App itself.
/// Only used against App endpoints, never handed to callers.
pub struct AppJwtSigner {
    app_id: u64,
    key: EncodingKey,
}

impl AppJwtSigner {
    pub fn new(app_id: u64, private_key_pem: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())?;
        Ok(Self { app_id, key })
    }

    pub fn app_id(&self) -> u64 {
        self.app_id
    }

    pub fn sign(&self) -> Result<String, ConnectionError> {
        self.sign_at(Utc::now())
    }

    fn sign_at(&self, now: DateTime<Utc>) -> Result<String, ConnectionError> {
        let now = now.timestamp();
        let claims = AppClaims {
            iat: now - ISSUED_AT_SKEW_SECS,
            exp: now + LIFETIME_SECS,
            iss: self.app_id.to_string(),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| ConnectionError::configuration(format!("failed to sign App JWT: {e}")))?;

        debug!(app_id = self.app_id, exp = claims.exp, "Signed GitHub App JWT");
        Ok(token)
    }
}
