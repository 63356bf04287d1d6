use crate::core::config::PipelineConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for transient stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to 10% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_cap = backoff.as_millis() as u64 / 10;
        if jitter_cap == 0 {
            return backoff;
        }
        let jitter = rand::rng().random_range(0..=jitter_cap);
        backoff + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retry_count: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let p = policy();
        for _ in 0..50 {
            let d = p.delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_zero_delay_has_no_jitter() {
        let p = RetryPolicy {
            retry_count: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(p.delay(3), Duration::ZERO);
    }
}
