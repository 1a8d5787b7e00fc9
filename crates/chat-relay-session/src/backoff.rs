//! Reconnect backoff policy.

use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^attempt, max_delay)`. The
/// session is abandoned when consecutive failures reach `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect following `attempt` earlier ones.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before reconnecting after `failures` consecutive failed
    /// connections, or `None` once `failures` reaches `max_attempts`.
    #[must_use]
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        (failures < self.max_attempts).then(|| self.delay_for(failures.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[test]
    fn test_exhaustion() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_delay(5), None);
        assert_eq!(policy.next_delay(6), None);

        let never = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(never.next_delay(1), None);
    }
}
