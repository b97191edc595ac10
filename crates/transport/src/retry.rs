//! Exponential-backoff retry policy shared by every reconnect path.

use std::time::Duration;

use crate::CancelToken;

/// Bounded retry schedule with exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts before the operation is abandoned.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Starts a fresh backoff sequence under this policy.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Iterator-style state for one retry sequence.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Returns the delay to sleep before the next attempt, or `None` once
    /// the attempt budget is exhausted. Delays double from `initial_delay`
    /// and are capped at `max_delay`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let exponent = self.attempt.min(16);
        self.attempt += 1;
        let delay = self
            .policy
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_delay);
        Some(delay)
    }

    /// Returns the number of attempts consumed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sleeps for the next delay through `cancel`. Returns `false` when the
    /// budget is exhausted or the token fired mid-sleep.
    pub fn sleep(&mut self, cancel: &CancelToken) -> bool {
        match self.next_delay() {
            Some(delay) => !cancel.wait_timeout(delay),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn delays_double_up_to_cap() {
        let mut backoff = policy(6, 100, 1000).backoff();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn budget_is_enforced() {
        let mut backoff = policy(2, 1, 10).backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn sleep_false_once_cancelled() {
        let mut backoff = policy(3, 1, 10).backoff();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(!backoff.sleep(&cancel));
    }

    #[test]
    fn sleep_true_while_budget_remains() {
        let mut backoff = policy(3, 1, 10).backoff();
        let cancel = CancelToken::new();
        assert!(backoff.sleep(&cancel));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = policy(40, 1000, 30_000).backoff();
        let mut last = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(30));
    }
}
