//! Outbox records and the store port used by the publisher.
//!
//! A record is written in the same transaction as the aggregate change it
//! describes, with status `PENDING`. The publisher later claims it under a
//! lease, publishes it and reconciles the outcome:
//!
//! ```text
//! PENDING ──► PROCESSING ──┬──► PUBLISHED
//!    ▲            │        ├──► RETRY_SCHEDULED ──► PROCESSING ...
//!    │            │        └──► DEAD ──(requeue)──► PENDING
//!    └── lease expired ◄───┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MessagingError, Result};
use crate::kind::EventKind;
use crate::retry::{RetryDecision, to_chrono};

/// Lifecycle of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
    RetryScheduled,
    Dead,
}

impl OutboxStatus {
    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::RetryScheduled => "RETRY_SCHEDULED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    /// Parses a stored status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            "RETRY_SCHEDULED" => Some(OutboxStatus::RetryScheduled),
            "DEAD" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }

    /// Returns true if the publisher will never touch the record again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Published | OutboxStatus::Dead | OutboxStatus::Failed
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of a service's outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    /// `attempt_count` at the last requeue; the retry budget counts from here.
    pub requeued_at_attempt: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Builds a `PENDING` record ready to be published at `now`.
    pub fn pending<K: EventKind, P: Serialize>(
        aggregate_id: impl Into<Uuid>,
        event_type: K,
        idempotency_key: impl Into<String>,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.as_str().to_string(),
            idempotency_key: idempotency_key.into(),
            payload: serde_json::to_value(payload)?,
            status: OutboxStatus::Pending,
            locked_by: None,
            locked_until: None,
            attempt_count: 0,
            requeued_at_attempt: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            published_at: None,
        })
    }

    /// Returns true if a publisher may claim the record at `now`.
    ///
    /// A `PROCESSING` record whose lease has expired is claimable again; its
    /// previous holder is presumed crashed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let lease_free = self.locked_until.is_none_or(|until| until <= now);
        match self.status {
            OutboxStatus::Pending | OutboxStatus::RetryScheduled => {
                self.next_attempt_at <= now && lease_free
            }
            OutboxStatus::Processing => self.locked_until.is_some_and(|until| until <= now),
            _ => false,
        }
    }

    /// Failed attempts since the record was last requeued.
    pub fn attempts_in_budget(&self) -> i32 {
        self.attempt_count - self.requeued_at_attempt
    }

    /// Returns true if `worker_id` currently holds the lease.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == OutboxStatus::Processing && self.locked_by.as_deref() == Some(worker_id)
    }

    /// Takes the lease.
    pub fn claim(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.locked_by = Some(worker_id.to_string());
        self.locked_until = Some(now + to_chrono(lease));
        self.updated_at = now;
    }

    /// Marks the record published and drops the lease.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.release_lock(now);
    }

    /// Records a failed attempt according to `decision` and drops the lease.
    pub fn fail(&mut self, decision: &RetryDecision, error: &str, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
        match decision {
            RetryDecision::RetryAt {
                next_attempt_at, ..
            } => {
                self.status = OutboxStatus::RetryScheduled;
                self.next_attempt_at = *next_attempt_at;
            }
            RetryDecision::Dead { .. } => {
                self.status = OutboxStatus::Dead;
            }
        }
        self.release_lock(now);
    }

    /// Moves a dead record back to `PENDING` with a fresh retry budget.
    /// `attempt_count` keeps counting.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != OutboxStatus::Dead {
            return Err(MessagingError::InvalidStatus {
                entity: "outbox",
                id: self.id.to_string(),
                status: self.status.to_string(),
                action: "requeue",
            });
        }
        self.status = OutboxStatus::Pending;
        self.requeued_at_attempt = self.attempt_count;
        self.next_attempt_at = now;
        self.last_error = None;
        self.release_lock(now);
        Ok(())
    }

    fn release_lock(&mut self, now: DateTime<Utc>) {
        self.locked_by = None;
        self.locked_until = None;
        self.updated_at = now;
    }
}

/// Storage port the publisher works against.
///
/// Writing records is not part of this trait: records are inserted by the
/// owning service inside its aggregate transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claims up to `limit` claimable records for `worker_id`.
    ///
    /// Concurrent callers never receive the same record.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>>;

    /// Marks a record published. Returns false if the lease was lost.
    async fn mark_published(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Records a failed attempt. Returns false if the lease was lost.
    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves a dead record back to pending.
    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Loads a record by id.
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>>;

    /// Counts records in a given status.
    async fn count_by_status(&self, status: OutboxStatus) -> Result<usize>;

    /// Deletes records published at or before `cutoff`. Returns how many went.
    async fn prune_published(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Ping,
    }

    impl EventKind for TestKind {
        fn as_str(&self) -> &'static str {
            "Ping"
        }

        fn topic(&self) -> &'static str {
            "test"
        }

        fn parse(name: &str) -> Option<Self> {
            (name == "Ping").then_some(TestKind::Ping)
        }
    }

    fn record(now: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord::pending(
            Uuid::new_v4(),
            TestKind::Ping,
            "key-1",
            &serde_json::json!({"n": 1}),
            now,
        )
        .unwrap()
    }

    #[test]
    fn pending_record_is_claimable_immediately() {
        let now = Utc::now();
        let r = record(now);
        assert_eq!(r.status, OutboxStatus::Pending);
        assert_eq!(r.event_type, "Ping");
        assert!(r.is_claimable(now));
        assert!(!r.is_claimable(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn claimed_record_is_not_claimable_until_lease_expires() {
        let now = Utc::now();
        let mut r = record(now);
        r.claim("w1", Duration::from_secs(30), now);

        assert!(r.is_held_by("w1"));
        assert!(!r.is_held_by("w2"));
        assert!(!r.is_claimable(now + chrono::Duration::seconds(29)));
        assert!(r.is_claimable(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn failure_schedules_retry_and_clears_lock() {
        let now = Utc::now();
        let mut r = record(now);
        r.claim("w1", Duration::from_secs(30), now);
        let next = now + chrono::Duration::seconds(2);
        r.fail(
            &RetryDecision::RetryAt {
                attempt: 1,
                next_attempt_at: next,
            },
            "broker down",
            now,
        );

        assert_eq!(r.status, OutboxStatus::RetryScheduled);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.next_attempt_at, next);
        assert!(r.locked_by.is_none());
        assert_eq!(r.last_error.as_deref(), Some("broker down"));
        assert!(!r.is_claimable(now));
        assert!(r.is_claimable(next));
    }

    #[test]
    fn dead_record_is_never_claimed_until_requeued() {
        let now = Utc::now();
        let mut r = record(now);
        for _ in 0..2 {
            r.fail(&RetryDecision::RetryAt { attempt: 1, next_attempt_at: now }, "boom", now);
        }
        r.fail(&RetryDecision::Dead { attempt: 3 }, "boom", now);
        assert!(r.status.is_terminal());
        assert!(!r.is_claimable(now + chrono::Duration::days(1)));

        r.requeue(now).unwrap();
        assert_eq!(r.status, OutboxStatus::Pending);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.attempts_in_budget(), 0);
        assert!(r.is_claimable(now));

        r.fail(&RetryDecision::RetryAt { attempt: 1, next_attempt_at: now }, "boom", now);
        assert_eq!(r.attempt_count, 4);
        assert_eq!(r.attempts_in_budget(), 1);
    }

    #[test]
    fn requeue_rejects_live_records() {
        let now = Utc::now();
        let mut r = record(now);
        assert!(matches!(
            r.requeue(now),
            Err(MessagingError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
            OutboxStatus::RetryScheduled,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("nope"), None);
    }
}
