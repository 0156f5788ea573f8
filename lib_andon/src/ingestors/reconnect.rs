//! Bounded exponential backoff for transport reconnects.

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::time::Duration;

/// Retry ceiling and delay bounds for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries allowed after a connection is lost before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Retries before the transport reports `Fatal`.
    /// * `base_delay` - First delay; each later retry doubles it.
    /// * `max_delay` - Cap on the doubled delay.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `min(base * 2^(attempt - 1), max)` for `attempt >= 1`; attempt `0` waits `base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether retry number `attempt` (1-based) is still within the ceiling.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let policy = ReconnectPolicy::new(10, Duration::from_millis(1000), Duration::from_millis(5000));
        let delays: Vec<u128> = (1..=6).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_delays_are_monotone_and_never_overflow() {
        let policy = ReconnectPolicy::default();
        let mut last = Duration::ZERO;
        for attempt in 1..=200 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last);
            assert!(delay <= policy.max_delay);
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = ReconnectPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100));
        assert!(policy.allows(1));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(!ReconnectPolicy::new(0, Duration::ZERO, Duration::ZERO).allows(1));
    }
}
