//! Exponential backoff with full jitter for bus resubscription.
//!
//! `delay = random(0, min(cap, base * 2^attempt))`, the AWS "Full
//! Jitter" strategy. The hub resets the calculator after a successful
//! resubscribe.

use std::time::Duration;

/// Default base delay between resubscription attempts.
pub const DEFAULT_BASE_MS: u64 = 500;
/// Default delay cap: resubscription never waits longer than 30 s.
pub const DEFAULT_MAX_MS: u64 = 30_000;

/// Exponential backoff calculator with full jitter.
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    /// Create a calculator with explicit base and cap.
    #[must_use]
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        let jittered = if capped == 0 { 0 } else { fastrand::u64(0..=capped) };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered)
    }

    /// Reset after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_MS, DEFAULT_MAX_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_bounded_by_base() {
        for _ in 0..100 {
            let mut b = Backoff::new(1000, 30_000);
            assert!(b.next_delay() <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let mut b = Backoff::new(1000, 5000);
        for _ in 0..20 {
            assert!(b.next_delay() <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut b = Backoff::new(1000, 30_000);
        for _ in 0..6 {
            let _ = b.next_delay();
        }
        b.reset();
        assert!(b.next_delay() <= Duration::from_millis(1000));
    }

    #[test]
    fn attempt_overflow_saturates() {
        let mut b = Backoff::new(1000, 30_000);
        for _ in 0..100 {
            let delay = b.next_delay();
            assert!(delay <= Duration::from_millis(30_000));
        }
    }
}
