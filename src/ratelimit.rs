//! Per-identity sliding-window rate limiter.

use crate::config::RateLimitConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Length of the sliding window
pub const WINDOW_SECS: i64 = 60;

/// Counts requests per identity over the trailing minute.
///
/// Each identity's window is mutated under its map shard lock, so
/// concurrent requests from one identity cannot lose or double-count
/// timestamps.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let span = Duration::seconds(WINDOW_SECS);
    // Timestamps are appended in arrival order, so stale ones sit at the front
    while window.front().is_some_and(|&ts| now - ts >= span) {
        window.pop_front();
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.max_requests_per_minute,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record a request from `identity` if it is within quota.
    /// Rejected requests are not counted.
    pub fn allow(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let mut window = self.windows.entry(identity.to_string()).or_default();
        prune(&mut window, now);
        if window.len() < self.limit {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests `identity` may still make in the current window
    pub fn remaining(&self, identity: &str, now: DateTime<Utc>) -> usize {
        match self.windows.get_mut(identity) {
            Some(mut window) => {
                prune(&mut window, now);
                self.limit.saturating_sub(window.len())
            }
            None => self.limit,
        }
    }

    /// Drop identities whose window has emptied; returns how many were dropped
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
