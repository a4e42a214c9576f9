//! Sliding-window admission control for structured operations.
//!
//! A [`RateLimiter`] keeps the timestamps of admitted requests in an ordered
//! deque bounded by `max_requests`. Entries that have aged out of the window
//! are pruned lazily on every call.
//!
//! The [`RateLimiterRegistry`] holds one limiter per [`OperationKind`] for a
//! whole engine and performs check and record under a single lock, so two
//! concurrent callers can never both take the last slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitRule;
use crate::error::SessionError;
use crate::types::OperationKind;

// ═══════════════════════════════════════════════════════════════════════════════
// SINGLE WINDOW
// ═══════════════════════════════════════════════════════════════════════════════

/// Sliding window of at most `max_requests` admissions per `window`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: VecDeque::with_capacity(max_requests),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether a request would be admitted now.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max_requests
    }

    /// Record an admitted request. Call only after `check` returned true.
    pub fn record(&mut self) {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) {
        self.prune(now);
        if self.timestamps.len() >= self.max_requests {
            // Never grow past the bound, even if the caller skipped `check`.
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
    }

    /// Zero when under the limit, otherwise the time until the oldest entry ages out.
    pub fn time_until_next_slot(&mut self) -> Duration {
        self.time_until_next_slot_at(Instant::now())
    }

    pub fn time_until_next_slot_at(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.timestamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match self.timestamps.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Admissions currently inside the window.
    pub fn in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.timestamps.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-KIND REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-kind limiters shared by every session of one engine.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<OperationKind, RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn from_rules(rules: &[RateLimitRule]) -> Self {
        let limiters = rules
            .iter()
            .map(|rule| (rule.kind, RateLimiter::new(rule.max_requests, rule.window())))
            .collect();
        Self {
            limiters: Mutex::new(limiters),
        }
    }

    /// Check and record atomically. Kinds without a rule always pass.
    pub fn try_acquire(&self, kind: OperationKind) -> Result<(), SessionError> {
        self.try_acquire_at(kind, Instant::now())
    }

    pub fn try_acquire_at(&self, kind: OperationKind, now: Instant) -> Result<(), SessionError> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(limiter) = limiters.get_mut(&kind) else {
            return Ok(());
        };

        if limiter.check_at(now) {
            limiter.record_at(now);
            debug!(kind = %kind, in_window = limiter.timestamps.len(), "rate limiter admitted request");
            Ok(())
        } else {
            let wait = limiter.time_until_next_slot_at(now);
            // Round up so a caller sleeping retry_after_ms lands past the boundary.
            let retry_after_ms = wait.as_millis().max(1).min(u128::from(u64::MAX)) as u64;
            warn!(kind = %kind, retry_after_ms, "rate limit exceeded");
            Err(SessionError::RateLimited {
                kind,
                retry_after_ms,
            })
        }
    }

    /// Time until `kind` would admit again.
    pub fn retry_after(&self, kind: OperationKind) -> Duration {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        limiters
            .get_mut(&kind)
            .map(|l| l.time_until_next_slot())
            .unwrap_or(Duration::ZERO)
    }
}
