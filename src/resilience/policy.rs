use std::time::Duration;

use crate::config::{BackoffKind, RetryConfig};

/// Delay between sink write attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let factor = 2u64.saturating_pow(attempt.min(32) as u32);
                let millis = (base.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Total attempts including the first write.
    pub max_attempts: usize,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            backoff: Backoff::Fixed(Duration::ZERO),
            max_attempts: 1,
        }
    }

    pub fn fixed(delay: Duration, max_attempts: usize) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let base = Duration::from_millis(config.base_ms);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(config.max_ms),
            },
        };
        Self {
            backoff,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_constant() {
        let backoff = Backoff::Fixed(Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_millis(200));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(1000), Duration::from_millis(500));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            backoff: BackoffKind::Fixed,
            base_ms: 50,
            max_ms: 1000,
            max_attempts: 0,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_millis(50)));
        assert_eq!(policy.max_attempts, 1);
    }
}
