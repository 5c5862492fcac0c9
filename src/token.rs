//! Capability tokens: signed, self-contained grants for one resource and purpose.
//!
//! Wire format is `base64url(claims JSON) "." base64url(HMAC-SHA256)`, both
//! segments unpadded. The MAC covers the encoded claims segment exactly as
//! transmitted, so verification never re-serializes untrusted input.
//!
//! The signing key lives only in process memory. Restarting the process
//! invalidates every outstanding token.

use crate::config::TokenConfig;
use crate::error::{KeyError, VerifyError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::digest::Key;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the signing key in bytes
pub const SIGNING_KEY_LENGTH: usize = 32;

/// What a grant may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    View,
    Thumbnail,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Thumbnail => "thumbnail",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "view" => Some(Self::View),
            "thumbnail" | "thumb" => Some(Self::Thumbnail),
            _ => None,
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symmetric key for token MACs. Never printed.
#[derive(Clone)]
pub struct SigningKey([u8; SIGNING_KEY_LENGTH]);

impl SigningKey {
    /// Draw a fresh key from the OS entropy source
    pub fn generate() -> Result<Self, KeyError> {
        let mut key = [0u8; SIGNING_KEY_LENGTH];
        OsRng.try_fill_bytes(&mut key)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; SIGNING_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC zero-pads keys shorter than the hash block
        let mut block = Key::<HmacSha256>::default();
        block[..SIGNING_KEY_LENGTH].copy_from_slice(&self.0);
        <HmacSha256 as Mac>::new(&block)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// The grant carried inside a token. Field order is the canonical encoding order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "rid")]
    pub resource_id: String,
    #[serde(rename = "sid")]
    pub session_id: String,
    #[serde(rename = "cip")]
    pub client_identity: String,
    #[serde(rename = "pur")]
    pub purpose: Purpose,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "jti")]
    pub token_id: String,
    #[serde(rename = "iss")]
    pub issuer: String,
}

impl Claims {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.issued_at, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }
}

/// Issues and verifies capability tokens
#[derive(Debug, Clone)]
pub struct TokenCodec {
    key: SigningKey,
    ttl: Duration,
    issuer: String,
    max_clock_skew: Duration,
}

impl TokenCodec {
    pub fn new(key: SigningKey, config: &TokenConfig) -> Self {
        Self {
            key,
            ttl: config.ttl(),
            issuer: config.issuer.clone(),
            max_clock_skew: config.max_clock_skew(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token for `resource_id`/`purpose`, bound to a session and identity
    pub fn issue(
        &self,
        resource_id: &str,
        session_id: &str,
        identity: &str,
        purpose: Purpose,
        now: DateTime<Utc>,
    ) -> String {
        let claims = Claims {
            resource_id: resource_id.to_string(),
            session_id: session_id.to_string(),
            client_identity: identity.to_string(),
            purpose,
            issued_at: now.timestamp(),
            expires_at: now
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .timestamp(),
            token_id: uuid::Uuid::new_v4().to_string(),
            issuer: self.issuer.clone(),
        };
        self.encode(&claims)
    }

    /// Serialize and sign an arbitrary claim set
    pub fn encode(&self, claims: &Claims) -> String {
        // A struct of strings and integers always serializes
        let json = serde_json::to_vec(claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.key.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }

    /// Check signature, then issuer and time bounds.
    ///
    /// Only integrity and time are checked here; matching the claims
    /// against the request is the caller's job.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, VerifyError> {
        let (payload, signature) = token.split_once('.').ok_or(VerifyError::Invalid)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| VerifyError::Invalid)?;

        let mut mac = self.key.mac();
        mac.update(payload.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| VerifyError::Invalid)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| VerifyError::Invalid)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| VerifyError::Invalid)?;

        if claims.issuer != self.issuer {
            return Err(VerifyError::Invalid);
        }
        let issued_in_future = now
            .checked_add_signed(self.max_clock_skew)
            .is_some_and(|latest| claims.issued_at > latest.timestamp());
        if issued_in_future {
            return Err(VerifyError::Invalid);
        }
        if now.timestamp() >= claims.expires_at {
            return Err(VerifyError::Expired);
        }
        Ok(claims)
    }
}
