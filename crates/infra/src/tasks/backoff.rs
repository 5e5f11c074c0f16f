//! Retry backoff and maximum task lifetime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff shared by every task kind.
///
/// `next_delay(r) = min(base * 2^r, cap)`. Pure: no clock, no randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first claim.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Age after which a task is considered stuck.
    pub max_age: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5 * 60),
            cap: Duration::from_secs(12 * 60 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Build a policy; a zero base is bumped to one millisecond so a claim
    /// always pushes visibility into the future.
    pub fn new(base: Duration, cap: Duration, max_age: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            cap: cap.max(base),
            max_age,
        }
    }

    /// Delay before the next attempt, given how often the task was claimed.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// `now + next_delay(retry_count)`, saturating at the end of time.
    pub fn next_execution_time(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.next_delay(retry_count))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a task created at `created_time` has outlived `max_age`.
    pub fn is_expired(&self, created_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.max_age) {
            Ok(max_age) => now - created_time > max_age,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_doubles_from_five_minutes() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_secs(300));
        assert_eq!(policy.next_delay(1), Duration::from_secs(600));
        assert_eq!(policy.next_delay(2), Duration::from_secs(1200));
        assert_eq!(policy.next_delay(3), Duration::from_secs(2400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(20), policy.cap);
        assert_eq!(policy.next_delay(u32::MAX), policy.cap);
    }

    #[test]
    fn zero_base_still_moves_forward() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(60));
        let now = Utc::now();
        assert!(policy.next_execution_time(now, 0) > now);
    }

    #[test]
    fn expiry_uses_max_age() {
        let policy = BackoffPolicy::default();
        let created = Utc::now();
        assert!(!policy.is_expired(created, created + chrono::Duration::hours(24)));
        assert!(policy.is_expired(created, created + chrono::Duration::hours(25)));
    }

    proptest! {
        /// Property: delays never shrink as the retry count grows, and the
        /// next execution time is always strictly after `now`.
        #[test]
        fn delay_is_monotonic_and_positive(
            base_ms in 1u64..600_000,
            cap_ms in 1u64..86_400_000,
            retry in 0u32..64,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
                Duration::from_secs(86_400),
            );
            prop_assert!(policy.next_delay(retry) <= policy.next_delay(retry + 1));

            let now = Utc::now();
            prop_assert!(policy.next_execution_time(now, retry) > now);
        }
    }
}
