//! # Exponential Backoff
//!
//! Provides a capped exponential backoff with full jitter for push retries.
//!
//! The ceiling doubles with every failed attempt (`base * 2^n`) until it
//! reaches `cap`. With full jitter the actual delay is drawn uniformly from
//! `[0, ceiling]`. The ceiling sequence is monotonic non-decreasing until [`ExponentialBackoff::reset`].
//!
//! ## Usage
//!
//! ```rust
//! use push_secret_controller::controller::backoff::{ExponentialBackoff, Jitter};
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300))
//!     .with_jitter(Jitter::None);
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! ```

use rand::rngs::OsRng;
use rand::Rng;
use std::time::Duration;

/// How the delay is derived from the current ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Uniform in `[0, ceiling]`
    Full,
    /// Exactly the ceiling
    None,
}

/// Exponential backoff calculator
///
/// Each triple owns its own instance, so one destination's failures never
/// stretch another destination's retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    jitter: Jitter,
}

impl ExponentialBackoff {
    /// Create a backoff with full jitter
    ///
    /// # Arguments
    ///
    /// * `base` - Ceiling of the first delay (typically 1s)
    /// * `cap` - Maximum ceiling (typically 5m)
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
            jitter: Jitter::Full,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Ceiling of the next delay, without advancing the sequence
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(OsRng.gen_range(0..=ceiling_ms))
            }
        }
    }

    /// Number of delays handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset the backoff to the initial state after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300))
            .with_jitter(Jitter::None)
    }

    #[test]
    fn test_exponential_sequence_caps() {
        let mut backoff = deterministic();
        let delays: Vec<u64> = (0..12).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300, 300]);
    }

    #[test]
    fn test_ceiling_is_monotonic() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        let mut previous = Duration::ZERO;
        for _ in 0..64 {
            let ceiling = backoff.ceiling();
            assert!(ceiling >= previous, "ceiling went down: {ceiling:?} < {previous:?}");
            previous = ceiling;
            backoff.next_backoff();
        }
        assert_eq!(previous, Duration::from_secs(300));
    }

    #[test]
    fn test_full_jitter_within_ceiling() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        for _ in 0..50 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_backoff();
            assert!(delay <= ceiling, "delay {delay:?} above ceiling {ceiling:?}");
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = deterministic();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_independent_state() {
        let mut first = deterministic();
        let mut second = deterministic();
        first.next_backoff();
        first.next_backoff();
        assert_eq!(second.next_backoff(), Duration::from_secs(1));
        assert_eq!(first.next_backoff(), Duration::from_secs(4));
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = deterministic();
        for _ in 0..1000 {
            backoff.next_backoff();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(300));
    }
}
