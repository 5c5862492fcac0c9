//! Time source and per-request context.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Supplies the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and the demo command.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, for a negative duration)
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything the core needs to know about one incoming request.
///
/// `identity` is the transport-level client address; it is opaque here.
/// `session_id` comes from the session header and `token` from the query
/// string, both untrusted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: String,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// Stamp a request from `identity` with the clock's current time
    pub fn new(identity: impl Into<String>, clock: &dyn Clock) -> Self {
        Self {
            identity: identity.into(),
            session_id: None,
            token: None,
            now: clock.now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}
