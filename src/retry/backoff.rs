//! Bounded exponential backoff with proportional jitter.

use std::time::Duration;

use rand::Rng;

/// Retry budget and delay curve.
///
/// `delay(n) = min(max_delay, initial_delay * multiplier^n + jitter)` with
/// `jitter` uniform in `[0, jitter_ratio * initial_delay * multiplier^n)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Hard cap on any single delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the exponential term.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter_ratio: 0.3,
        }
    }
}

impl BackoffPolicy {
    /// Exponential term for the `attempt`-th retry (0-based), uncapped.
    #[must_use]
    pub fn exponential_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent)
    }

    /// Delay before the `attempt`-th retry (0-based), jitter drawn from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential = self.exponential_ms(attempt);
        let spread = exponential * self.jitter_ratio;
        let jitter = if spread > 0.0 && spread.is_finite() {
            rng.gen_range(0.0..spread)
        } else {
            0.0
        };
        let cap = self.max_delay.as_millis() as f64;
        let millis = (exponential + jitter).min(cap);
        if millis.is_finite() && millis > 0.0 {
            Duration::from_millis(millis as u64)
        } else {
            self.max_delay
        }
    }

    /// Delay before the `attempt`-th retry (0-based) using the thread RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Whether a job that has failed `attempt_count` times is exhausted.
    #[must_use]
    pub const fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn progression_without_jitter() {
        let policy = BackoffPolicy {
            jitter_ratio: 0.0,
            ..BackoffPolicy::default()
        };
        let delays: Vec<u128> = (0..7).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..4 {
            let base = policy.exponential_ms(attempt);
            for _ in 0..200 {
                let d = policy.delay_with(attempt, &mut rng).as_millis() as f64;
                assert!(d >= base);
                assert!(d < base * 1.3 + 1.0);
            }
        }
    }

    #[test]
    fn delays_never_decrease_and_respect_cap() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let mut previous = Duration::ZERO;
            for attempt in 0..10 {
                let d = policy.delay_with(attempt, &mut rng);
                assert!(d >= previous);
                assert!(d <= policy.max_delay);
                previous = d;
            }
        }
    }

    #[test]
    fn exhaustion_after_max_retries() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }
}
