//! Fixed-schedule retry policy and the scheduler that turns a failed
//! attempt into its successor or a dead-letter entry.
//!
//! Backoff is a pure function of the attempt number. There is no jitter:
//! attempt `n` failing at `t` schedules attempt `n + 1` at exactly
//! `t + schedule[n - 1]`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::models::{
    DeadLetterEntry, DeadLetterId, DeliveryAttempt, Disposition, OwnerId,
};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Default backoff schedule in seconds.
pub const DEFAULT_RETRY_SCHEDULE_SECS: [u64; 5] = [30, 60, 120, 240, 480];

/// Default number of attempts per chain, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry policy configuration for webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Delay after attempt `n` fails is `schedule[n - 1]`.
    pub schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: DEFAULT_RETRY_SCHEDULE_SECS.iter().copied().map(Duration::from_secs).collect(),
        }
    }
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// Attempt number of the successor
        next_attempt_number: u32,
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry - delivery permanently failed.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryPolicy {
    /// Builds a policy from a schedule given in seconds.
    pub fn from_secs(max_attempts: u32, schedule: &[u64]) -> Self {
        Self { max_attempts, schedule: schedule.iter().copied().map(Duration::from_secs).collect() }
    }

    /// Checks that every attempt before the last has a delay.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero attempt budget
    /// or a schedule shorter than `max_attempts - 1`.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        let needed = self.max_attempts as usize - 1;
        if self.schedule.len() < needed {
            return Err(DeliveryError::configuration(format!(
                "retry schedule has {} entries, {needed} needed for {} attempts",
                self.schedule.len(),
                self.max_attempts
            )));
        }
        Ok(())
    }

    /// Delay after attempt `attempt_number` fails, if the schedule has one.
    pub fn backoff(&self, attempt_number: u32) -> Option<Duration> {
        let index = attempt_number.checked_sub(1)? as usize;
        self.schedule.get(index).copied()
    }

    /// Decides what follows a failed attempt.
    pub fn decide(
        &self,
        attempt_number: u32,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        let Some(delay) = self.backoff(attempt_number) else {
            return RetryDecision::GiveUp {
                reason: format!("no backoff configured after attempt {attempt_number}"),
            };
        };
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry {
            next_attempt_number: attempt_number + 1,
            next_attempt_at: failed_at + delay,
        }
    }
}

/// Turns failed attempts into successors or dead letters.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    /// Creates a scheduler applying `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Builds the disposition for `attempt`, which failed with `error` at
    /// `now`. `owner_id` is recorded on the dead-letter entry.
    pub fn on_failure(
        &self,
        attempt: &DeliveryAttempt,
        owner_id: OwnerId,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Disposition {
        match self.policy.decide(attempt.attempt_number, error, now) {
            RetryDecision::Retry { next_attempt_number, next_attempt_at } => {
                Disposition::Retry(DeliveryAttempt::pending(
                    attempt.subscription_id,
                    attempt.event_id,
                    attempt.event_type.clone(),
                    attempt.generation,
                    next_attempt_number,
                    next_attempt_at,
                ))
            },
            RetryDecision::GiveUp { reason } => {
                tracing::debug!(attempt_id = %attempt.id, %reason, "giving up on delivery chain");
                Disposition::DeadLetter(DeadLetterEntry {
                    id: DeadLetterId::new(),
                    attempt_id: attempt.id,
                    subscription_id: attempt.subscription_id,
                    owner_id,
                    event_id: attempt.event_id,
                    event_type: attempt.event_type.clone(),
                    failure_reason: Some(error.to_string()),
                    last_http_status: error.status_code().map(i32::from),
                    replayed_by: None,
                    replayed_at: None,
                    replay_count: 0,
                    created_at: now,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::models::{EventId, SubscriptionId};
    use proptest::prelude::*;

    use super::*;

    fn attempt(number: u32) -> DeliveryAttempt {
        DeliveryAttempt::pending(
            SubscriptionId::new(),
            EventId::new(),
            "clip.approved",
            0,
            number,
            Utc::now(),
        )
    }

    #[test]
    fn default_schedule_matches_backoff_table() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).filter_map(|n| policy.backoff(n)).map(|d| d.as_secs()).collect();

        assert_eq!(delays, vec![30, 60, 120, 240, 480]);
        assert_eq!(policy.backoff(0), None);
        assert_eq!(policy.backoff(6), None);
    }

    #[test]
    fn fifth_failure_dead_letters() {
        let scheduler = RetryScheduler::default();
        let failed = attempt(5);
        let owner = OwnerId::new();

        let disposition =
            scheduler.on_failure(&failed, owner, &DeliveryError::from_status(500, "boom"), Utc::now());

        let Disposition::DeadLetter(entry) = disposition else {
            panic!("expected dead letter, got {disposition:?}");
        };
        assert_eq!(entry.attempt_id, failed.id);
        assert_eq!(entry.owner_id, owner);
        assert_eq!(entry.last_http_status, Some(500));
        assert_eq!(entry.replay_count, 0);
    }

    #[test]
    fn successor_keeps_generation_and_pair() {
        let scheduler = RetryScheduler::default();
        let mut failed = attempt(2);
        failed.generation = 3;
        let now = Utc::now();

        let Disposition::Retry(next) =
            scheduler.on_failure(&failed, OwnerId::new(), &DeliveryError::timeout(10), now)
        else {
            panic!("expected retry");
        };

        assert_eq!(next.attempt_number, 3);
        assert_eq!(next.generation, 3);
        assert_eq!(next.subscription_id, failed.subscription_id);
        assert_eq!(next.event_id, failed.event_id);
        assert_eq!(next.scheduled_at, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn client_errors_are_retried_like_server_errors() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert_eq!(
            policy.decide(1, &DeliveryError::from_status(404, ""), now),
            policy.decide(1, &DeliveryError::from_status(503, ""), now)
        );
    }

    #[test]
    fn validation_rejects_short_schedules() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::from_secs(5, &[30, 60]).validate().is_err());
        assert!(RetryPolicy::from_secs(0, &[]).validate().is_err());
        assert!(RetryPolicy::from_secs(1, &[]).validate().is_ok());
    }

    proptest! {
        #[test]
        fn retry_time_is_failure_time_plus_backoff(n in 1u32..5, offset in 0i64..1_000_000) {
            let policy = RetryPolicy::default();
            let failed_at = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(offset);

            let decision = policy.decide(n, &DeliveryError::network("refused"), failed_at);

            let expected = failed_at
                + chrono::Duration::seconds(i64::try_from(DEFAULT_RETRY_SCHEDULE_SECS[(n - 1) as usize]).unwrap());
            prop_assert_eq!(
                decision,
                RetryDecision::Retry { next_attempt_number: n + 1, next_attempt_at: expected }
            );
        }

        #[test]
        fn attempts_at_or_past_budget_never_retry(n in 5u32..100) {
            let decision = RetryPolicy::default().decide(n, &DeliveryError::timeout(10), Utc::now());
            prop_assert!(matches!(decision, RetryDecision::GiveUp { .. }), "unexpected retry");
        }
    }
}
