//! Endpoint-level operations built on the access policy.
//!
//! Each method corresponds to one client-facing call (create session, list,
//! fetch, like, session info, logout, violation report). Transport code maps
//! the returned values to responses; nothing here knows about HTTP beyond
//! the status hints on `DenyReason`.

use crate::audit::AuditLog;
use crate::catalog::{Catalog, Renderer, ResourceEntry};
use crate::clock::{Clock, RequestContext};
use crate::config::Config;
use crate::error::{DenyReason, KeyError};
use crate::policy::{AccessDecision, AccessPolicy};
use crate::ratelimit::RateLimiter;
use crate::session::{Session, SessionStore, Sweeper};
use crate::token::{Purpose, SigningKey, TokenCodec};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Returned from explicit session creation
#[derive(Debug, Clone, Serialize)]
pub struct SessionTicket {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One listed resource with ready-to-use grant URLs
#[derive(Debug, Clone, Serialize)]
pub struct ResourceListing {
    #[serde(flatten)]
    pub entry: ResourceEntry,
    pub url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub session_id: String,
    /// The client had no usable session and was given this one
    pub session_created: bool,
    pub resources: Vec<ResourceListing>,
}

/// Result of a resource fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Rendered {
        resource_id: String,
        purpose: Purpose,
        bytes: Vec<u8>,
    },
    /// Access was granted but rendering failed
    Fallback {
        resource_id: String,
        purpose: Purpose,
        message: String,
    },
    Denied(DenyReason),
}

/// A client-side security report
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationReport {
    #[serde(default)]
    pub violation: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Monitor,
    Event,
    Breach,
}

impl Severity {
    /// Classify a report by the markers clients put in the violation text
    pub fn classify(violation: &str) -> Self {
        if violation.contains("BREACH") {
            Self::Breach
        } else if violation.contains("MONITORED") {
            Self::Monitor
        } else {
            Self::Event
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Event => "event",
            Self::Breach => "breach",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub active_sessions: usize,
    pub tracked_identities: usize,
}

/// Path a client fetches a granted resource from
pub fn resource_url(resource_id: &str, purpose: Purpose, token: &str) -> String {
    format!("/api/secure/image/{}/{}?token={}", resource_id, purpose, token)
}

pub struct Gateway {
    policy: AccessPolicy,
    catalog: Arc<dyn Catalog>,
    renderer: Arc<dyn Renderer>,
    audit: Option<Mutex<AuditLog>>,
    sweep_interval: std::time::Duration,
}

impl Gateway {
    /// Build the full stack with a freshly generated signing key
    pub fn new(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, KeyError> {
        let key = SigningKey::generate()?;
        Self::with_key(config, key, catalog, renderer)
    }

    pub fn with_key(
        config: &Config,
        key: SigningKey,
        catalog: Arc<dyn Catalog>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, KeyError> {
        // Ended sessions are remembered for as long as their tokens can live
        let sessions = SessionStore::new(&config.session)?
            .with_revocation_window(config.token.ttl() + config.token.max_clock_skew());
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let codec = TokenCodec::new(key, &config.token);
        Ok(Self {
            policy: AccessPolicy::new(config, Arc::new(sessions), limiter, codec),
            catalog,
            renderer,
            audit: None,
            sweep_interval: std::time::Duration::from_secs(config.session.sweep_interval_secs),
        })
    }

    /// Record decisions to `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(Mutex::new(audit));
        self
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.policy.sessions()
    }

    fn audit(&self, f: impl FnOnce(&mut AuditLog) -> Result<()>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut log = audit.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = f(&mut log) {
            warn!(error = %e, path = %log.path.display(), "audit write failed");
        }
    }

    fn audit_decision(
        &self,
        ctx: &RequestContext,
        operation: &str,
        reason: Option<DenyReason>,
        token_id: Option<&str>,
    ) {
        self.audit(|log| log.decision(ctx.now, &ctx.identity, operation, reason, token_id));
    }

    pub fn create_session(&self, ctx: &RequestContext) -> Result<SessionTicket, DenyReason> {
        let result = self.policy.open_session(ctx);
        self.audit_decision(ctx, "create_session", result.as_ref().err().copied(), None);
        let session = result?;
        self.audit(|log| log.session_event(ctx.now, &ctx.identity, "created"));
        Ok(SessionTicket {
            session_id: session.session_id,
            expires_at: session.expires_at,
        })
    }

    /// List resources, minting a view and a thumbnail token for each.
    /// A catalog failure yields an empty listing rather than an error.
    pub fn list_resources(&self, ctx: &RequestContext) -> Listing {
        let grant = self.policy.admit_listing(ctx);
        self.audit_decision(ctx, "list", None, None);
        if grant.created {
            self.audit(|log| log.session_event(ctx.now, &ctx.identity, "created"));
        }

        let entries = self.catalog.list_resources().unwrap_or_else(|e| {
            error!(error = %e, "catalog listing failed");
            Vec::new()
        });

        let resources = entries
            .into_iter()
            .map(|entry| {
                let view = self
                    .policy
                    .issue(ctx, &grant.session, &entry.id, Purpose::View);
                let thumb = self
                    .policy
                    .issue(ctx, &grant.session, &entry.id, Purpose::Thumbnail);
                ResourceListing {
                    url: resource_url(&entry.id, Purpose::View, &view),
                    thumbnail_url: resource_url(&entry.id, Purpose::Thumbnail, &thumb),
                    entry,
                }
            })
            .collect();

        Listing {
            session_id: grant.session.session_id,
            session_created: grant.created,
            resources,
        }
    }

    /// Authorize and render one resource.
    ///
    /// View counts are best-effort; a counter failure is logged and the
    /// fetch proceeds. A render failure after a grant becomes a labeled
    /// fallback, never a denial.
    pub fn fetch(&self, ctx: &RequestContext, resource_id: &str, purpose: Purpose) -> FetchOutcome {
        let (decision, token_id) = self.policy.authorize_fetch(ctx, resource_id, purpose);
        self.audit_decision(ctx, purpose.as_str(), decision.reason(), token_id.as_deref());

        let resource_id = match decision {
            AccessDecision::Granted { resource_id, .. } => resource_id,
            AccessDecision::Denied { reason } => return FetchOutcome::Denied(reason),
        };

        if purpose == Purpose::View {
            if let Err(e) = self.catalog.record_view(&resource_id) {
                warn!(resource_id = %resource_id, error = %e, "view counter update failed");
            }
        }

        match self.renderer.render(&resource_id, purpose) {
            Ok(bytes) => FetchOutcome::Rendered {
                resource_id,
                purpose,
                bytes,
            },
            Err(e) => {
                error!(resource_id = %resource_id, %purpose, error = %e, "render failed after grant");
                FetchOutcome::Fallback {
                    resource_id,
                    purpose,
                    message: "resource temporarily unavailable".to_string(),
                }
            }
        }
    }

    /// Like a resource. Returns the new like count when the catalog recorded it.
    pub fn like(&self, ctx: &RequestContext, resource_id: &str) -> Result<Option<u64>, DenyReason> {
        let result = self.policy.require_session(ctx);
        self.audit_decision(ctx, "like", result.as_ref().err().copied(), None);
        result?;

        match self.catalog.record_like(resource_id) {
            Ok(likes) => Ok(Some(likes)),
            Err(e) => {
                warn!(resource_id, error = %e, "like counter update failed");
                Ok(None)
            }
        }
    }

    pub fn session_info(&self, ctx: &RequestContext) -> Result<Session, DenyReason> {
        let result = self.policy.require_session(ctx);
        self.audit_decision(ctx, "session_info", result.as_ref().err().copied(), None);
        result
    }

    pub fn logout(&self, ctx: &RequestContext) -> Result<(), DenyReason> {
        let result = self.policy.require_session(ctx);
        self.audit_decision(ctx, "logout", result.as_ref().err().copied(), None);
        let session = result?;
        self.sessions().destroy(&session.session_id, ctx.now);
        self.audit(|log| log.session_event(ctx.now, &ctx.identity, "destroyed"));
        Ok(())
    }

    /// Record a client-side security report. Always succeeds.
    pub fn report_violation(&self, ctx: &RequestContext, report: &ViolationReport) -> Severity {
        let violation = if report.violation.is_empty() {
            "Unknown violation"
        } else {
            report.violation.as_str()
        };
        let severity = Severity::classify(violation);
        match severity {
            Severity::Monitor => info!(identity = %ctx.identity, violation, "security monitor"),
            Severity::Event => warn!(identity = %ctx.identity, violation, "security event"),
            Severity::Breach => error!(
                identity = %ctx.identity,
                violation,
                user_agent = report.user_agent.as_deref().unwrap_or("Unknown"),
                "security breach reported"
            ),
        }
        self.audit(|log| {
            log.security_violation(
                ctx.now,
                &ctx.identity,
                severity.as_str(),
                violation,
                report.user_agent.as_deref(),
            )
        });
        severity
    }

    /// Reclaim expired sessions and idle rate windows
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let sessions = self.sessions().sweep(now);
        self.policy.limiter().sweep(now);
        sessions
    }

    /// Run `sweep` in the background every configured interval until the
    /// returned handle is dropped
    pub fn start_sweeper(&self, clock: Arc<dyn Clock>) -> Sweeper {
        self.start_sweeper_every(clock, self.sweep_interval)
    }

    pub fn start_sweeper_every(
        &self,
        clock: Arc<dyn Clock>,
        interval: std::time::Duration,
    ) -> Sweeper {
        let sessions = self.sessions().clone();
        let limiter = self.policy.limiter().clone();
        Sweeper::spawn(clock, interval, move |now| {
            sessions.sweep(now);
            limiter.sweep(now);
        })
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            active_sessions: self.sessions().len(),
            tracked_identities: self.policy.limiter().tracked(),
        }
    }
}
