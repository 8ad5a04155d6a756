//! Poll scheduling with exponential backoff after repeated failures.

use std::time::Duration;

/// Scheduling parameters of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay between polls while the meter answers.
    pub interval: Duration,
    /// Consecutive fully-failed polls before backing off.
    pub threshold: u32,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

/// Counts consecutive fully-failed polls and derives the next delay.
///
/// Below the threshold the delay is the plain interval. From the threshold
/// on it doubles with every further failure, `interval * 2^(n - threshold + 1)`,
/// up to `max_delay`. One success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            policy,
            consecutive_failures: 0,
        }
    }

    /// Records a fully-failed poll and returns the failure streak.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_backing_off(&self) -> bool {
        self.consecutive_failures >= self.policy.threshold
    }

    pub fn next_delay(&self) -> Duration {
        if !self.is_backing_off() {
            return self.policy.interval;
        }

        let doublings = self.consecutive_failures - self.policy.threshold + 1;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.policy
            .interval
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            interval: Duration::from_secs(60),
            threshold: 3,
            max_delay: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_interval_below_threshold() {
        let mut backoff = Backoff::new(policy());
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        backoff.record_failure();
        backoff.record_failure();
        assert!(!backoff.is_backing_off());
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<u64> = (0..7)
            .map(|_| {
                backoff.record_failure();
                backoff.next_delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![60, 60, 120, 240, 480, 600, 600]);
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..5 {
            backoff.record_failure();
        }
        assert!(backoff.is_backing_off());
        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_long_streak_saturates() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..100 {
            backoff.record_failure();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(600));
    }
}
