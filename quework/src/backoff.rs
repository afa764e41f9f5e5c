//! Retry spacing for failed jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capped exponential backoff: `base * 2^(error_count - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before a job that has failed `error_count` times becomes eligible again.
    ///
    /// Non-decreasing in `error_count`; zero for counts below one.
    pub fn delay(&self, error_count: i32) -> Duration {
        if error_count <= 0 {
            return Duration::ZERO;
        }

        let exponent = (error_count - 1).min(31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Absolute retry time for a failure observed at `now`
    pub fn retry_at(&self, now: DateTime<Utc>, error_count: i32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(error_count))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_from_base_until_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(i32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn retry_at_adds_delay() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.retry_at(now, 3), now + chrono::Duration::seconds(4));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: more failures never shorten the wait, and the wait never exceeds the cap.
        #[test]
        fn delay_is_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            max_ms in 1u64..10_000_000,
            count in -5i32..200,
        ) {
            let policy = BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));

            prop_assert!(policy.delay(count) <= policy.delay(count + 1));
            prop_assert!(policy.delay(count) <= policy.max);
        }
    }
}
