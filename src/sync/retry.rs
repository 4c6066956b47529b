use std::time::Duration;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base: Duration::from_millis(config.retry_backoff_base_ms),
            cap: Duration::from_millis(config.retry_backoff_cap_ms),
        }
    }

    /// Delay after the given (1-based) failed attempt: `base * 2^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

/// The `Syncing { attempt }` state of one batch write.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts started so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Move to the next attempt and return its number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Backoff before another attempt, or `None` once the budget is spent.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_after(self.attempt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = policy(10);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(350));
        assert_eq!(p.delay_after(40), Duration::from_millis(350));
    }

    #[test]
    fn test_attempt_budget() {
        let mut state = RetryState::new(policy(3));
        assert_eq!(state.begin_attempt(), 1);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(state.begin_attempt(), 2);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(state.begin_attempt(), 3);
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.attempt(), 3);
    }
}
