use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use governor::{
    Quota,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};

use crate::config::RateLimitPolicy;
use crate::error::ServiceError;

/// Keys held beyond this count trigger eviction of fully-refilled entries.
const PRUNE_THRESHOLD: usize = 10_000;

type KeyedLimiter = governor::RateLimiter<Identity, DashMapStateStore<Identity>, DefaultClock>;

/// Caller key for rate accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.ip().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-identity GCRA limiter. Each key's state is a single atomic cell, so
/// concurrent callers for the same identity never lose an update and callers
/// for different identities never contend.
///
/// Fully refilled keys are swept at most once per window, and only while
/// more than `prune_threshold` keys are held.
pub struct RateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    started: Instant,
    /// Milliseconds after `started` of the last sweep.
    last_prune: AtomicU64,
    prune_threshold: usize,
    prune_interval: Duration,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        let quota = policy
            .quota()
            .unwrap_or_else(|| Quota::per_second(policy.requests));
        let clock = DefaultClock::default();
        let limiter = KeyedLimiter::dashmap_with_clock(quota, &clock);
        Self {
            limiter,
            clock,
            started: Instant::now(),
            last_prune: AtomicU64::new(0),
            prune_threshold: PRUNE_THRESHOLD,
            prune_interval: policy.window,
        }
    }

    #[cfg(test)]
    fn with_pruning(mut self, threshold: usize, interval: Duration) -> Self {
        self.prune_threshold = threshold;
        self.prune_interval = interval;
        self
    }

    pub fn allow(&self, identity: &Identity) -> bool {
        self.check(identity).is_ok()
    }

    pub fn check(&self, identity: &Identity) -> Result<(), ServiceError> {
        let outcome = self.limiter.check_key(identity);
        self.maybe_prune();
        outcome.map_err(|not_until| ServiceError::RateLimited {
            retry_after: not_until.wait_time_from(self.clock.now()),
        })
    }

    fn maybe_prune(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_prune.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.prune_interval.as_millis() as u64 {
            return;
        }
        if self.limiter.len() <= self.prune_threshold {
            return;
        }
        // one caller per interval wins the sweep
        if self
            .last_prune
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.limiter.retain_recent();
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.limiter.len()
    }
}
