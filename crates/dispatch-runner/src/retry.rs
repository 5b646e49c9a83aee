//! Capped exponential backoff for transient job failures.

use std::time::Duration;

use dispatch_core::RunnerSettings;

/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self::new(
            settings.retry_max,
            Duration::from_secs(settings.retry_backoff_base_seconds),
            Duration::from_secs(settings.retry_backoff_max_seconds),
        )
    }

    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`,
    /// never above `cap`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RunnerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_budget_counts_first_run() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn test_defaults_follow_runner_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base, Duration::from_secs(2));
        assert_eq!(policy.cap, Duration::from_secs(60));
    }
}
