//! Retry delays for failed operations.

use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential backoff with random jitter.
///
/// The delay before retry `n` (1-based) is `base * 2^(n-1)`, capped at `max`,
/// plus up to `max_jitter` so clients that failed together do not retry
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub const fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.base_backoff,
            max: config.max_backoff,
            max_jitter: config.max_jitter,
        }
    }

    /// Capped exponential delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt).saturating_add(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
        }
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(16));
        assert_eq!(policy.base_delay(7), Duration::from_secs(60));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        for attempt in 1..=10 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.base_delay(attempt));
            assert!(delay <= policy.base_delay(attempt) + policy.max_jitter);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..policy()
        };
        assert_eq!(policy.delay(3), Duration::from_secs(4));
    }
}
