//! Bounded exponential backoff with jitter.
//!
//! `delay(n) = min(base * 2^n, max)`, then scaled by a random factor in
//! `[1 - jitter, 1]` so a fleet of clients that lost the same broker do not
//! reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Exponent cap; `2^16 * base` is already far beyond any sane `max`.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay that may be shaved off at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.5,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// The un-jittered delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// The delay to actually sleep before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter <= 0.0 {
            return ceiling;
        }
        let scale = rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0);
        ceiling.mul_f64(scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_secs(1));
        assert_eq!(b.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        for attempt in 0..8 {
            let ceiling = b.ceiling(attempt);
            for _ in 0..50 {
                let d = b.delay(attempt);
                assert!(d <= ceiling);
                assert!(d >= ceiling.mul_f64(0.5) - Duration::from_nanos(1));
            }
        }
    }

    #[test]
    fn jitter_is_clamped() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(20)).with_jitter(7.0);
        assert_eq!(b.jitter, 1.0);
    }
}
