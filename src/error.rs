//! Error and denial types shared across the access-control core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a request was refused. Safe to show to clients: none of the
/// variants carry secrets or internal detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    NoSession,
    TokenExpired,
    TokenInvalid,
    PurposeMismatch,
    ResourceMismatch,
    SessionMismatch,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::NoSession => "no_session",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::PurposeMismatch => "purpose_mismatch",
            Self::ResourceMismatch => "resource_mismatch",
            Self::SessionMismatch => "session_mismatch",
        }
    }

    /// HTTP status class a transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::NoSession | Self::TokenExpired | Self::TokenInvalid => 401,
            Self::PurposeMismatch | Self::ResourceMismatch | Self::SessionMismatch => 403,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cryptographic or temporal token failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

impl From<VerifyError> for DenyReason {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Expired => DenyReason::TokenExpired,
            VerifyError::Invalid => DenyReason::TokenInvalid,
        }
    }
}

/// The OS entropy source failed. Fatal at startup.
#[derive(Debug, Error)]
#[error("entropy source unavailable: {0}")]
pub struct KeyError(#[from] pub rand::Error);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("render failed for {resource_id}: {message}")]
    Failed {
        resource_id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_reason_wire_names() {
        assert_eq!(DenyReason::RateLimited.to_string(), "rate_limited");
        assert_eq!(
            serde_json::to_string(&DenyReason::PurposeMismatch).unwrap(),
            "\"purpose_mismatch\""
        );
    }

    #[test]
    fn test_deny_reason_status_codes() {
        assert_eq!(DenyReason::RateLimited.status_code(), 429);
        assert_eq!(DenyReason::NoSession.status_code(), 401);
        assert_eq!(DenyReason::TokenExpired.status_code(), 401);
        assert_eq!(DenyReason::ResourceMismatch.status_code(), 403);
        assert_eq!(DenyReason::SessionMismatch.status_code(), 403);
    }

    #[test]
    fn test_verify_error_maps_to_reason() {
        assert_eq!(DenyReason::from(VerifyError::Expired), DenyReason::TokenExpired);
        assert_eq!(DenyReason::from(VerifyError::Invalid), DenyReason::TokenInvalid);
    }
}
