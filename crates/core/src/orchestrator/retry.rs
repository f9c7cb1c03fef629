//! Retry backoff policy.

use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// The delay after failed attempt `n` (1-based) is `base * 2^(n-1)`, capped
/// at `max`. With the defaults this gives 30s, 60s, 120s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt budget stamped on each newly admitted job.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before re-queueing after attempt `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30), Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(10), Duration::from_secs(120));
    }

    #[test]
    fn test_monotonic() {
        let policy = RetryPolicy::new(8, Duration::from_secs(5), Duration::from_secs(300));
        let delays: Vec<_> = (1..=8).map(|n| policy.backoff(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(120));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(120));
    }

    #[test]
    fn test_default_budget() {
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }
}
