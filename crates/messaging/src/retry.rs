//! Retry scheduling for outbox publishing and conflict retries.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ConflictAware;

/// Exponential backoff with a ceiling and a retry budget.
///
/// After the k-th failed attempt the next attempt is scheduled
/// `min(max_delay, base_delay * 2^(k-1))` later. Once the attempt count
/// exceeds `max_retries` the record is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

/// What to do with a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    RetryAt {
        attempt: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Give up; the record needs manual requeue.
    Dead { attempt: i32 },
}

impl RetryDecision {
    /// The attempt count to persist.
    pub fn attempt(&self) -> i32 {
        match self {
            RetryDecision::RetryAt { attempt, .. } | RetryDecision::Dead { attempt } => *attempt,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Delay before the attempt following the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decides the fate of a record whose failed attempts now total `attempt`.
    pub fn decide(&self, attempt: i32, now: DateTime<Utc>) -> RetryDecision {
        if attempt > self.max_retries as i32 {
            return RetryDecision::Dead { attempt };
        }
        let delay = self.backoff(attempt.max(1) as u32);
        RetryDecision::RetryAt {
            attempt,
            next_attempt_at: now + to_chrono(delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

/// Converts a std duration into a chrono one at millisecond precision.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

/// Re-runs `operation` while it fails with an optimistic-lock conflict.
///
/// Gives up after `max_attempts` and returns the last error.
pub async fn retry_on_conflict<T, E, F, Fut>(max_attempts: u32, mut operation: F) -> Result<T, E>
where
    E: ConflictAware + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                tracing::debug!(attempt, error = %e, "optimistic lock conflict, retrying");
                metrics::counter!("optimistic_lock_retries_total").increment(1);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessagingError;
    use common::Version;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 8)
    }

    #[test]
    fn backoff_doubles_until_ceiling() {
        let p = policy();
        let delays: Vec<u64> = (1..=8).map(|k| p.backoff(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_never_overflows() {
        assert_eq!(policy().backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn decide_schedules_relative_to_now() {
        let now = Utc::now();
        match policy().decide(3, now) {
            RetryDecision::RetryAt {
                attempt,
                next_attempt_at,
            } => {
                assert_eq!(attempt, 3);
                assert_eq!(next_attempt_at - now, chrono::Duration::seconds(4));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn dead_exactly_when_attempts_exceed_max_retries() {
        let p = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        let now = Utc::now();
        assert!(matches!(p.decide(3, now), RetryDecision::RetryAt { .. }));
        assert_eq!(p.decide(4, now), RetryDecision::Dead { attempt: 4 });
    }

    fn conflict() -> MessagingError {
        MessagingError::ConcurrencyConflict {
            entity: "Order",
            id: "1".to_string(),
            expected: Version::new(1),
            actual: Version::new(2),
        }
    }

    #[tokio::test]
    async fn retry_on_conflict_retries_then_succeeds() {
        let mut calls = 0;
        let result: Result<u32, MessagingError> = retry_on_conflict(3, || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Err(conflict())
                } else {
                    Ok(current)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_on_conflict_gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), MessagingError> = retry_on_conflict(2, || {
            calls += 1;
            async { Err(conflict()) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn retry_on_conflict_does_not_retry_other_errors() {
        let mut calls = 0;
        let result: Result<(), MessagingError> = retry_on_conflict(5, || {
            calls += 1;
            async {
                Err(MessagingError::Unrouted {
                    event_type: "X".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

            #[test]
            fn backoff_is_monotonic_and_capped(
                base_ms in 1u64..10_000,
                max_ms in 1u64..600_000,
                attempt in 1u32..64,
            ) {
                let p = RetryPolicy::new(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms),
                    5,
                );
                prop_assert!(p.backoff(attempt) <= p.backoff(attempt + 1));
                prop_assert!(p.backoff(attempt + 1) <= p.max_delay);
            }

            #[test]
            fn dead_iff_attempts_exceed_budget(max_retries in 0u32..20, attempt in 1i32..40) {
                let now = Utc::now();
                let dead = matches!(
                    policy_with(max_retries).decide(attempt, now),
                    RetryDecision::Dead { .. }
                );
                prop_assert_eq!(dead, attempt > max_retries as i32);
            }
        }

        fn policy_with(max_retries: u32) -> RetryPolicy {
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), max_retries)
        }
    }
}
