//! Session store: creation, validation and expiry of client sessions.
//!
//! Sessions are bound to the identity (network address) that created them.
//! The store is the only writer of session records; all mutation of one
//! record happens under that record's shard lock in the backend.

use crate::clock::Clock;
use crate::config::{SessionConfig, MAX_CLOCK_SKEW_SECS, MAX_TOKEN_TTL_MINUTES};
use crate::error::KeyError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Random bytes per session id (256 bits)
const SESSION_ID_BYTES: usize = 32;

/// How long a deliberately ended session id is remembered when the store is
/// not told the token lifetime: the longest token lifetime plus skew.
const DEFAULT_REVOCATION_WINDOW_SECS: i64 =
    (MAX_TOKEN_TTL_MINUTES * 60 + MAX_CLOCK_SKEW_SECS) as i64;

/// An active client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_count: u64,
}

impl Session {
    fn new(session_id: String, identity: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            session_id,
            identity: identity.to_string(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            request_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Generate an unguessable, URL-safe session identifier
pub fn generate_session_id<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// What `touch` should do with the record after the callback ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    Keep,
    Evict,
}

/// Storage behind the session store.
///
/// Implementations must run `touch` callbacks while holding exclusive
/// access to that key so concurrent validations of one session serialize.
pub trait SessionBackend: Send + Sync {
    fn get(&self, session_id: &str) -> Option<Session>;
    fn put(&self, session: Session);
    fn delete(&self, session_id: &str) -> Option<Session>;
    /// Run `f` on the record, removing it if `f` returns `Touch::Evict`.
    /// Returns false when the key is unknown.
    fn touch(&self, session_id: &str, f: &mut dyn FnMut(&mut Session) -> Touch) -> bool;
    /// Keep only records for which `keep` is true; returns how many were removed
    fn retain(&self, keep: &mut dyn FnMut(&Session) -> bool) -> usize;
    fn len(&self) -> usize;
}

/// In-process backend on a sharded concurrent map
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: DashMap<String, Session>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for MemoryBackend {
    fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn put(&self, session: Session) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    fn delete(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    fn touch(&self, session_id: &str, f: &mut dyn FnMut(&mut Session) -> Touch) -> bool {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if f(entry.get_mut()) == Touch::Evict {
                    entry.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    fn retain(&self, keep: &mut dyn FnMut(&Session) -> bool) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| keep(s));
        before.saturating_sub(self.sessions.len())
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Result of validating a presented session id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Unknown,
    /// The session had expired and has been evicted
    Expired,
    /// Presented from another identity; evicted under strict binding
    IdentityMismatch,
    /// Ended on purpose (logout, superseded, hijack eviction). Terminal.
    Revoked,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Process-wide table of active sessions
pub struct SessionStore {
    backend: Box<dyn SessionBackend>,
    ttl: Duration,
    strict_identity_binding: bool,
    /// Seeded once from the OS; session ids are drawn from it
    id_rng: Mutex<StdRng>,
    /// Ids of sessions ended on purpose, with the time they ended
    revoked: DashMap<String, DateTime<Utc>>,
    revocation_window: Duration,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Result<Self, KeyError> {
        Self::with_backend(config, Box::new(MemoryBackend::new()))
    }

    pub fn with_backend(
        config: &SessionConfig,
        backend: Box<dyn SessionBackend>,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            backend,
            ttl: config.ttl(),
            strict_identity_binding: config.strict_identity_binding,
            id_rng: Mutex::new(StdRng::from_rng(OsRng)?),
            revoked: DashMap::new(),
            revocation_window: Duration::seconds(DEFAULT_REVOCATION_WINDOW_SECS),
        })
    }

    /// Remember ended sessions for `window`, the longest a token naming
    /// them can stay valid
    pub fn with_revocation_window(mut self, window: Duration) -> Self {
        self.revocation_window = window;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn next_id(&self) -> String {
        let mut rng = self.id_rng.lock().unwrap_or_else(|e| e.into_inner());
        generate_session_id(&mut *rng)
    }

    fn revoke(&self, session_id: &str, now: DateTime<Utc>) {
        self.revoked.insert(session_id.to_string(), now);
    }

    /// True when the session was ended on purpose within the revocation window
    pub fn is_revoked(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.revoked
            .get(session_id)
            .is_some_and(|ended| self.remembers(*ended, now))
    }

    fn remembers(&self, ended: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        ended
            .checked_add_signed(self.revocation_window)
            .map_or(true, |until| now < until)
    }

    /// Start a new session for `identity`
    pub fn create(&self, identity: &str, now: DateTime<Utc>) -> Session {
        let session = Session::new(self.next_id(), identity, now, self.ttl);
        self.backend.put(session.clone());
        info!(identity, expires_at = %session.expires_at, "session created");
        session
    }

    /// Start a new session for `identity`, ending any other session it holds
    pub fn create_exclusive(&self, identity: &str, now: DateTime<Utc>) -> Session {
        let mut superseded = Vec::new();
        self.backend.retain(&mut |s| {
            if s.identity == identity {
                superseded.push(s.session_id.clone());
                false
            } else {
                true
            }
        });
        if !superseded.is_empty() {
            info!(identity, cleared = superseded.len(), "superseded existing sessions");
        }
        for id in &superseded {
            self.revoke(id, now);
        }
        self.create(identity, now)
    }

    /// Re-insert a session under a known id. Only for ids that arrived inside
    /// a verified capability token and were not revoked.
    pub fn restore(&self, session_id: &str, identity: &str, now: DateTime<Utc>) -> Session {
        let mut session = Session::new(session_id.to_string(), identity, now, self.ttl);
        session.request_count = 1;
        self.backend.put(session.clone());
        info!(identity, "session re-established from token");
        session
    }

    /// Check a presented session id against the requesting identity.
    ///
    /// Expired sessions are evicted. A session presented from a different
    /// identity is evicted and revoked as a suspected hijack under strict
    /// binding, and tolerated with a warning otherwise. Valid sessions have
    /// their request counter incremented.
    pub fn validate_detailed(
        &self,
        session_id: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Validation {
        let strict = self.strict_identity_binding;
        let mut verdict = Validation::Unknown;

        let found = self.backend.touch(session_id, &mut |session| {
            if session.is_expired(now) {
                verdict = Validation::Expired;
                return Touch::Evict;
            }
            if session.identity != identity {
                if strict {
                    verdict = Validation::IdentityMismatch;
                    return Touch::Evict;
                }
                warn!(
                    recorded = %session.identity,
                    presented = identity,
                    "session identity changed, tolerated by lenient binding"
                );
            }
            session.request_count += 1;
            verdict = Validation::Valid;
            Touch::Keep
        });

        if !found && self.is_revoked(session_id, now) {
            verdict = Validation::Revoked;
        }

        match verdict {
            Validation::Expired => debug!(identity, "session expired and evicted"),
            Validation::IdentityMismatch => {
                self.revoke(session_id, now);
                warn!(identity, "session presented from another identity, evicted")
            }
            Validation::Revoked => debug!(identity, "revoked session presented"),
            _ if !found => debug!(identity, "unknown session"),
            _ => {}
        }
        verdict
    }

    pub fn validate(&self, session_id: &str, identity: &str, now: DateTime<Utc>) -> bool {
        self.validate_detailed(session_id, identity, now).is_valid()
    }

    /// End a session. Ending an unknown session is not an error.
    pub fn destroy(&self, session_id: &str, now: DateTime<Utc>) {
        if self.backend.delete(session_id).is_some() {
            self.revoke(session_id, now);
            info!("session destroyed");
        }
    }

    /// Return the supplied session if it validates, otherwise a fresh one.
    /// The boolean is true when a new session was created.
    pub fn resolve_or_create(
        &self,
        identity: &str,
        supplied: Option<&str>,
        now: DateTime<Utc>,
    ) -> (Session, bool) {
        if let Some(id) = supplied {
            if self.validate(id, identity, now) {
                if let Some(session) = self.backend.get(id) {
                    return (session, false);
                }
            }
        }
        info!(identity, "onboarding client with a new session");
        (self.create(identity, now), true)
    }

    /// Snapshot of a session, without touching its counters
    pub fn info(&self, session_id: &str) -> Option<Session> {
        self.backend.get(session_id)
    }

    /// Drop every expired session and forget revocations no token can
    /// outlive; returns how many sessions were removed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let removed = self.backend.retain(&mut |s| !s.is_expired(now));
        self.revoked.retain(|_, ended| self.remembers(*ended, now));
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        removed
    }

    /// Number of remembered revocations
    pub fn revoked_len(&self) -> usize {
        self.revoked.len()
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background thread that runs a housekeeping pass every interval.
/// Stops when dropped.
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn<F>(clock: Arc<dyn Clock>, interval: std::time::Duration, sweep: F) -> Self
    where
        F: Fn(DateTime<Utc>) + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => sweep(clock.now()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    const A: &str = "203.0.113.5";
    const B: &str = "198.51.100.7";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn store() -> SessionStore {
        SessionStore::new(&SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_session_id_entropy_and_uniqueness() {
        let a = generate_session_id(&mut OsRng);
        let b = generate_session_id(&mut OsRng);
        assert_ne!(a, b);
        // 32 bytes base64url without padding
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_create_sets_expiry() {
        let store = store();
        let session = store.create(A, t0());
        assert_eq!(session.identity, A);
        assert_eq!(session.expires_at, t0() + Duration::seconds(3600));
        assert_eq!(session.request_count, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_validate_increments_count() {
        let store = store();
        let session = store.create(A, t0());
        assert!(store.validate(&session.session_id, A, t0()));
        assert!(store.validate(&session.session_id, A, t0() + Duration::seconds(5)));
        assert_eq!(store.info(&session.session_id).unwrap().request_count, 2);
    }

    #[test]
    fn test_validate_unknown() {
        let store = store();
        assert_eq!(
            store.validate_detailed("nope", A, t0()),
            Validation::Unknown
        );
    }

    #[test]
    fn test_expired_session_is_evicted() {
        let store = store();
        let session = store.create(A, t0());
        let later = t0() + Duration::seconds(3601);
        assert_eq!(
            store.validate_detailed(&session.session_id, A, later),
            Validation::Expired
        );
        assert!(store.info(&session.session_id).is_none());
        assert_eq!(
            store.validate_detailed(&session.session_id, A, later),
            Validation::Unknown
        );
    }

    #[test]
    fn test_session_valid_at_exact_expiry() {
        let store = store();
        let session = store.create(A, t0());
        assert!(store.validate(&session.session_id, A, session.expires_at));
    }

    #[test]
    fn test_identity_mismatch_evicts_under_strict_binding() {
        let store = store();
        let session = store.create(A, t0());

        assert_eq!(
            store.validate_detailed(&session.session_id, B, t0()),
            Validation::IdentityMismatch
        );
        // The first owner can no longer use it either
        assert!(!store.validate(&session.session_id, A, t0()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_identity_mismatch_tolerated_when_lenient() {
        let config = SessionConfig {
            strict_identity_binding: false,
            ..SessionConfig::default()
        };
        let store = SessionStore::new(&config).unwrap();
        let session = store.create(A, t0());

        assert!(store.validate(&session.session_id, B, t0()));
        assert!(store.validate(&session.session_id, A, t0()));
        assert_eq!(store.info(&session.session_id).unwrap().request_count, 2);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let store = store();
        let session = store.create(A, t0());
        store.destroy(&session.session_id, t0());
        store.destroy(&session.session_id, t0());
        store.destroy("never-existed", t0());
        assert!(store.is_empty());
    }

    #[test]
    fn test_destroyed_session_stays_revoked() {
        let store = store();
        let session = store.create(A, t0());
        store.destroy(&session.session_id, t0());

        assert_eq!(
            store.validate_detailed(&session.session_id, A, t0()),
            Validation::Revoked
        );
        assert!(store.is_revoked(&session.session_id, t0()));
        // Unknown ids are not remembered
        assert!(!store.is_revoked("never-existed", t0()));
        assert_eq!(store.revoked_len(), 1);
    }

    #[test]
    fn test_identity_mismatch_revokes() {
        let store = store();
        let session = store.create(A, t0());
        store.validate(&session.session_id, B, t0());

        assert_eq!(
            store.validate_detailed(&session.session_id, A, t0()),
            Validation::Revoked
        );
    }

    #[test]
    fn test_expired_session_is_not_revoked() {
        let store = store();
        let session = store.create(A, t0());
        let later = t0() + Duration::seconds(3601);
        store.validate(&session.session_id, A, later);
        assert!(!store.is_revoked(&session.session_id, later));
    }

    #[test]
    fn test_revocations_forgotten_after_window() {
        let store = store().with_revocation_window(Duration::minutes(15));
        let session = store.create(A, t0());
        store.destroy(&session.session_id, t0());

        store.sweep(t0() + Duration::minutes(14));
        assert_eq!(store.revoked_len(), 1);
        store.sweep(t0() + Duration::minutes(15));
        assert_eq!(store.revoked_len(), 0);
        assert!(!store.is_revoked(&session.session_id, t0() + Duration::minutes(15)));
    }

    #[test]
    fn test_stores_draw_distinct_ids() {
        let a = store().create(A, t0());
        let b = store().create(A, t0());
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.session_id.len(), 43);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let config = SessionConfig {
            ttl_secs: u64::MAX,
            ..SessionConfig::default()
        };
        let store = SessionStore::new(&config).unwrap();
        let session = store.create(A, t0());
        assert!(session.expires_at > t0());
        assert!(store.validate(&session.session_id, A, t0()));
    }

    #[test]
    fn test_resolve_or_create() {
        let store = store();
        let (first, created) = store.resolve_or_create(A, None, t0());
        assert!(created);

        let (again, created) = store.resolve_or_create(A, Some(&first.session_id), t0());
        assert!(!created);
        assert_eq!(again.session_id, first.session_id);

        let (fresh, created) = store.resolve_or_create(A, Some("bogus"), t0());
        assert!(created);
        assert_ne!(fresh.session_id, first.session_id);
    }

    #[test]
    fn test_create_exclusive_supersedes_same_identity() {
        let store = store();
        let old = store.create(A, t0());
        let other = store.create(B, t0());

        let new = store.create_exclusive(A, t0());
        assert!(store.info(&old.session_id).is_none());
        assert!(store.info(&other.session_id).is_some());
        assert!(store.info(&new.session_id).is_some());
        assert_eq!(store.len(), 2);
        assert!(store.is_revoked(&old.session_id, t0()));
        assert!(!store.is_revoked(&other.session_id, t0()));
    }

    #[test]
    fn test_restore_keeps_session_id() {
        let store = store();
        let restored = store.restore("from-token", A, t0());
        assert_eq!(restored.session_id, "from-token");
        assert!(store.validate("from-token", A, t0()));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = store();
        let old = store.create(A, t0());
        let young = store.create(B, t0() + Duration::seconds(1800));

        let removed = store.sweep(t0() + Duration::seconds(3700));
        assert_eq!(removed, 1);
        assert!(store.info(&old.session_id).is_none());
        assert!(store.info(&young.session_id).is_some());
    }

    #[test]
    fn test_sweeper_thread_reclaims_sessions() {
        let store = Arc::new(store());
        let clock = Arc::new(ManualClock::new(t0()));
        store.create(A, t0());
        clock.advance(Duration::seconds(7200));

        let swept = store.clone();
        let interval = std::time::Duration::from_millis(5);
        let sweeper = Sweeper::spawn(clock.clone(), interval, move |now| {
            swept.sweep(now);
        });
        for _ in 0..200 {
            if store.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        drop(sweeper);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_validation_counts_every_request() {
        let store = Arc::new(store());
        let session = store.create(A, t0());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = session.session_id.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(store.validate(&id, A, t0()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.info(&session.session_id).unwrap().request_count, 800);
    }
}
