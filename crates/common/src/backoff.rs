//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy: `base * 2^(attempt-1)`, capped, with a
/// uniform jitter factor applied so that retrying peers do not synchronize.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fractional jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Creates a policy.
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// Returns the delay before the given retry attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << shift);
        let capped = raw.min(self.cap);

        if self.jitter <= 0.0 {
            return capped;
        }

        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        let jittered = capped.mul_f64(factor);
        jittered.min(self.cap)
    }
}

impl Default for BackoffPolicy {
    /// Base 1s, cap 30s, ±20% jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30), 0.0);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(64), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.2);
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(800), "delay {d:?} below jitter floor");
            assert!(d <= Duration::from_millis(1200), "delay {d:?} above jitter ceiling");
        }
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(20), Duration::from_secs(30), 0.2);
        for _ in 0..100 {
            assert!(policy.delay(5) <= Duration::from_secs(30));
        }
    }
}
