//! Lease token signing and verification.
//!
//! Lease tokens are HS256 JWTs over `{task_id, peer_id, exp, iat}`. The
//! signing secret is supplied by the process configuration (`WEFT_SECRET_KEY`)
//! and never leaves this type.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LeaseTokenError {
    #[error("lease token expired")]
    Expired,
    #[error("invalid lease token: {0}")]
    Invalid(String),
    #[error("failed to sign lease token: {0}")]
    Signing(String),
}

/// Claims carried by a lease token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseClaims {
    pub task_id: Uuid,
    pub peer_id: String,
    pub exp: i64,
    pub iat: i64,
}

/// HS256 signer/verifier for lease tokens.
#[derive(Clone)]
pub struct LeaseSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for LeaseSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSigner")
            .field("encoding_key", &"<redacted>")
            .field("decoding_key", &"<redacted>")
            .finish()
    }
}

impl LeaseSigner {
    pub fn from_secret(secret: &str) -> Self {
        let secret = secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Sign a lease token for `task_id`/`peer_id` valid until `expires_at`.
    pub fn issue(
        &self,
        task_id: Uuid,
        peer_id: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, LeaseTokenError> {
        let claims = LeaseClaims {
            task_id,
            peer_id: peer_id.to_string(),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| LeaseTokenError::Signing(err.to_string()))
    }

    /// Verify a lease token, distinguishing expiry from any other defect.
    pub fn verify(&self, token: &str) -> Result<LeaseClaims, LeaseTokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        match decode::<LeaseClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(LeaseTokenError::Expired),
                _ => Err(LeaseTokenError::Invalid(err.to_string())),
            },
        }
    }
}
