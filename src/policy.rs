//! Access policy evaluator.
//!
//! Composes the rate limiter, the session store and the token codec into
//! one decision per request. Expected denials are returned as values, never
//! as errors. Checks run in a fixed order and stop at the first failure:
//! rate limit, then session or token, then claim cross-checks, then the
//! session named by the token.

use crate::clock::RequestContext;
use crate::config::{Config, SessionConfig};
use crate::error::DenyReason;
use crate::ratelimit::RateLimiter;
use crate::session::{Session, SessionStore, Validation};
use crate::token::{Purpose, TokenCodec};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a resource fetch evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Granted {
        session_id: String,
        resource_id: String,
        purpose: Purpose,
    },
    Denied {
        reason: DenyReason,
    },
}

impl AccessDecision {
    pub fn denied(reason: DenyReason) -> Self {
        Self::Denied { reason }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Self::Granted { .. } => None,
            Self::Denied { reason } => Some(*reason),
        }
    }
}

/// How a rate-limit breach is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateClass {
    /// Log and continue (browsing traffic)
    Soft,
    /// Deny (credential minting and session mutation)
    Hard,
}

/// A session admitted for a listing request
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: Session,
    /// True when the client arrived without a usable session and got a new one
    pub created: bool,
}

/// The single composition point for authorization decisions
pub struct AccessPolicy {
    sessions: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    codec: TokenCodec,
    config: SessionConfig,
}

impl AccessPolicy {
    pub fn new(
        config: &Config,
        sessions: Arc<SessionStore>,
        limiter: Arc<RateLimiter>,
        codec: TokenCodec,
    ) -> Self {
        Self {
            sessions,
            limiter,
            codec,
            config: config.session.clone(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    fn check_rate(&self, ctx: &RequestContext, class: RateClass) -> Result<(), DenyReason> {
        if self.limiter.allow(&ctx.identity, ctx.now) {
            return Ok(());
        }
        match class {
            RateClass::Soft => {
                warn!(identity = %ctx.identity, "rate limit exceeded, serving anyway");
                Ok(())
            }
            RateClass::Hard => {
                warn!(identity = %ctx.identity, "rate limit exceeded");
                Err(DenyReason::RateLimited)
            }
        }
    }

    /// Explicit session creation. Supersedes the identity's other sessions
    /// when configured for one session per identity.
    pub fn open_session(&self, ctx: &RequestContext) -> Result<Session, DenyReason> {
        self.check_rate(ctx, RateClass::Hard)?;
        let session = if self.config.single_session_per_identity {
            self.sessions.create_exclusive(&ctx.identity, ctx.now)
        } else {
            self.sessions.create(&ctx.identity, ctx.now)
        };
        Ok(session)
    }

    /// Admit a listing request: resolve the supplied session or onboard the
    /// client with a new one. Never denies.
    pub fn admit_listing(&self, ctx: &RequestContext) -> SessionGrant {
        let _ = self.check_rate(ctx, RateClass::Soft);
        let (session, created) =
            self.sessions
                .resolve_or_create(&ctx.identity, ctx.session_id.as_deref(), ctx.now);
        SessionGrant { session, created }
    }

    /// Strictly validate the supplied session (logout, like, session info)
    pub fn require_session(&self, ctx: &RequestContext) -> Result<Session, DenyReason> {
        self.check_rate(ctx, RateClass::Hard)?;
        let session_id = ctx.session_id.as_deref().ok_or(DenyReason::NoSession)?;
        match self
            .sessions
            .validate_detailed(session_id, &ctx.identity, ctx.now)
        {
            Validation::Valid => self.sessions.info(session_id).ok_or(DenyReason::NoSession),
            Validation::IdentityMismatch => Err(DenyReason::SessionMismatch),
            Validation::Unknown | Validation::Expired | Validation::Revoked => {
                Err(DenyReason::NoSession)
            }
        }
    }

    /// Mint a token for a session the caller has already admitted
    pub fn issue(
        &self,
        ctx: &RequestContext,
        session: &Session,
        resource_id: &str,
        purpose: Purpose,
    ) -> String {
        self.codec
            .issue(resource_id, &session.session_id, &ctx.identity, purpose, ctx.now)
    }

    /// Decide whether the token in `ctx` grants `purpose` access to `resource_id`.
    ///
    /// Returns the decision and, when the token's signature verified, its
    /// token id for the audit trail.
    pub fn authorize_fetch(
        &self,
        ctx: &RequestContext,
        resource_id: &str,
        purpose: Purpose,
    ) -> (AccessDecision, Option<String>) {
        if let Err(reason) = self.check_rate(ctx, RateClass::Hard) {
            return (AccessDecision::denied(reason), None);
        }

        let Some(token) = ctx.token.as_deref() else {
            warn!(identity = %ctx.identity, resource_id, "fetch without token");
            return (AccessDecision::denied(DenyReason::TokenInvalid), None);
        };

        let claims = match self.codec.verify(token, ctx.now) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(identity = %ctx.identity, resource_id, error = %err, "token rejected");
                return (AccessDecision::denied(err.into()), None);
            }
        };
        let token_id = Some(claims.token_id.clone());

        let deny = |reason: DenyReason| {
            warn!(
                identity = %ctx.identity,
                resource_id,
                token_id = %claims.token_id,
                %reason,
                "fetch denied"
            );
            (AccessDecision::denied(reason), token_id.clone())
        };

        if claims.resource_id != resource_id {
            return deny(DenyReason::ResourceMismatch);
        }
        if claims.purpose != purpose {
            return deny(DenyReason::PurposeMismatch);
        }
        if let Some(header) = ctx.session_id.as_deref() {
            if header != claims.session_id {
                return deny(DenyReason::SessionMismatch);
            }
        }

        let identity_matches = claims.client_identity == ctx.identity;
        if !identity_matches {
            if self.config.strict_identity_binding {
                return deny(DenyReason::SessionMismatch);
            }
            warn!(
                issued_to = %claims.client_identity,
                presented = %ctx.identity,
                "token used from another identity, tolerated by lenient binding"
            );
        }

        match self
            .sessions
            .validate_detailed(&claims.session_id, &ctx.identity, ctx.now)
        {
            Validation::Valid => {}
            Validation::IdentityMismatch => return deny(DenyReason::SessionMismatch),
            // Logged out, superseded or evicted as hijacked
            Validation::Revoked => return deny(DenyReason::NoSession),
            Validation::Unknown | Validation::Expired => {
                // Signature and expiry already passed, so the session id is trustworthy
                if !self.config.reestablish_from_token {
                    return deny(DenyReason::NoSession);
                }
                self.sessions
                    .restore(&claims.session_id, &claims.client_identity, ctx.now);
            }
        }

        debug!(
            identity = %ctx.identity,
            resource_id,
            %purpose,
            token_id = %claims.token_id,
            "fetch granted"
        );
        let decision = AccessDecision::Granted {
            session_id: claims.session_id.clone(),
            resource_id: claims.resource_id.clone(),
            purpose,
        };
        (decision, token_id)
    }
}
