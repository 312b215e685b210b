//! Forwarder-wide retry window.
//!
//! One `BackoffScheduler` gates every remote delivery cycle: after a failed
//! cycle the next attempt waits `min(ceiling, base^min(failures, exponent_cap))`
//! seconds; a successful cycle reopens the window immediately.

use std::time::Duration;
use tokio::time::Instant;

/// Exponential delay curve with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: u32,
    pub ceiling: Duration,
    pub exponent_cap: u32,
}

impl BackoffPolicy {
    /// Delay after the `failures`-th consecutive failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.exponent_cap);
        let secs = u64::from(self.base).saturating_pow(exponent);
        Duration::from_secs(secs).min(self.ceiling)
    }
}

#[derive(Debug)]
pub struct BackoffScheduler {
    consecutive_failures: u32,
    next_attempt_at: Instant,
}

impl BackoffScheduler {
    pub fn new(now: Instant) -> Self {
        BackoffScheduler {
            consecutive_failures: 0,
            next_attempt_at: now,
        }
    }

    /// True when a new delivery cycle may start.
    pub fn is_open(&self, now: Instant) -> bool {
        now >= self.next_attempt_at
    }

    /// Time left until the window opens; zero when already open.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_attempt_at.saturating_duration_since(now)
    }

    /// Register a failed cycle and return the wait it imposes.
    pub fn record_failure(&mut self, now: Instant, policy: &BackoffPolicy) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let wait = policy.delay_for(self.consecutive_failures);
        self.next_attempt_at = now + wait;
        wait
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.next_attempt_at = now;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
