//! Retry policy for failed task executions.
//!
//! Implements exponential backoff with optional upward jitter.

use rand::Rng;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed per occurrence, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay, jitter included.
    pub cap: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,
    /// Fraction of the computed delay that may be added as random jitter.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    ///
    /// Uses `base * factor^(attempt - 1)`, clamped to `cap`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(self.cap)
    }

    /// `delay(attempt)` plus up to `jitter_ratio` of it, never above `cap`.
    /// Jitter only ever lengthens the delay.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ratio <= 0.0 || delay >= self.cap {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter_ratio);
        let jittered = Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + extra))
            .unwrap_or(self.cap);
        jittered.min(self.cap)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(600),
            factor: 2.0,
            jitter_ratio: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base, Duration::from_secs(30));
        assert_eq!(policy.cap, Duration::from_secs(600));
        assert_eq!(policy.factor, 2.0);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(60));

        // attempt=1: 10 * 2^0 = 10
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        // attempt=2: 10 * 2^1 = 20
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        // attempt=3: 10 * 2^2 = 40
        assert_eq!(policy.delay(3), Duration::from_secs(40));
    }

    #[test]
    fn test_backoff_capping() {
        let policy = RetryPolicy::new(10, Duration::from_secs(10), Duration::from_secs(60));

        // attempt=4: 10 * 2^3 = 80 -> capped at 60
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert_eq!(policy.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_monotonic_and_bounded() {
        let policy = RetryPolicy::new(12, Duration::from_secs(7), Duration::from_secs(900));
        for n in 1..policy.max_attempts {
            assert!(policy.delay(n + 1) >= policy.delay(n));
            assert!(policy.delay(n) <= policy.cap);
        }
    }

    #[test]
    fn test_huge_delays_saturate_at_cap() {
        let policy = RetryPolicy::new(100, Duration::MAX, Duration::MAX).with_jitter(1.0);
        assert_eq!(policy.delay(1), Duration::MAX);
        assert_eq!(policy.delay(64), Duration::MAX);
        assert_eq!(policy.delay_with_jitter(2), Duration::MAX);

        let policy = RetryPolicy::new(100, Duration::from_secs(u64::MAX / 4), Duration::MAX)
            .with_jitter(1.0);
        for _ in 0..50 {
            assert!(policy.delay_with_jitter(1) >= policy.delay(1));
        }
    }

    #[test]
    fn test_jitter_never_below_base_or_above_cap() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(0.5);
        for _ in 0..200 {
            for attempt in 1..=5 {
                let d = policy.delay_with_jitter(attempt);
                assert!(d >= policy.delay(attempt));
                assert!(d >= policy.base);
                assert!(d <= policy.cap);
            }
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.delay_with_jitter(2), Duration::from_secs(20));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
