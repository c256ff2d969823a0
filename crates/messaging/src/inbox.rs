//! Inbox records and the idempotency guard.
//!
//! Every inbound event and every deduplicated command is first recorded under
//! a unique `(scope, action, idempotency_key)` triple. A second insert with the
//! same triple never overwrites the first; the guard resolves it to the
//! existing record instead.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::Clock;

use crate::error::{MessagingError, Result};

/// Processing state of an inbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboxStatus {
    Received,
    Processed,
    FailedRetry,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Received => "RECEIVED",
            InboxStatus::Processed => "PROCESSED",
            InboxStatus::FailedRetry => "FAILED_RETRY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(InboxStatus::Received),
            "PROCESSED" => Some(InboxStatus::Processed),
            "FAILED_RETRY" => Some(InboxStatus::FailedRetry),
            _ => None,
        }
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of a service's inbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: Uuid,
    pub scope: String,
    pub action: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: InboxStatus,
    pub attempts: i32,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl InboxRecord {
    /// Builds a `RECEIVED` record.
    pub fn received(
        scope: impl Into<String>,
        action: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            action: action.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            status: InboxStatus::Received,
            attempts: 0,
            received_at: now,
            processed_at: None,
        }
    }

    /// Returns the unique key of the record.
    pub fn key(&self) -> InboxKey {
        InboxKey::new(&self.scope, &self.action, &self.idempotency_key)
    }

    pub fn is_processed(&self) -> bool {
        self.status == InboxStatus::Processed
    }

    /// Marks the record processed. Fails if it already was.
    pub fn process(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_processed() {
            return Err(MessagingError::AlreadyProcessed { id: self.id });
        }
        self.status = InboxStatus::Processed;
        self.processed_at = Some(now);
        Ok(())
    }

    /// Records a failed handling attempt.
    pub fn fail_retry(&mut self) -> Result<()> {
        if self.is_processed() {
            return Err(MessagingError::AlreadyProcessed { id: self.id });
        }
        self.status = InboxStatus::FailedRetry;
        self.attempts += 1;
        Ok(())
    }
}

/// The unique `(scope, action, idempotency_key)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboxKey {
    pub scope: String,
    pub action: String,
    pub idempotency_key: String,
}

impl InboxKey {
    pub fn new(scope: &str, action: &str, idempotency_key: &str) -> Self {
        Self {
            scope: scope.to_string(),
            action: action.to_string(),
            idempotency_key: idempotency_key.to_string(),
        }
    }
}

/// Storage port for inbox records.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Inserts a record. Fails with `UniqueViolation` if the key exists.
    async fn insert(&self, record: InboxRecord) -> Result<()>;

    /// Loads a record by its unique key.
    async fn find(&self, scope: &str, action: &str, key: &str) -> Result<Option<InboxRecord>>;

    /// Marks a record processed. Fails with `AlreadyProcessed` if it already was.
    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Records a failed handling attempt.
    async fn mark_failed_retry(&self, id: Uuid) -> Result<()>;

    /// Deletes records processed at or before `cutoff`. A redelivery of a
    /// pruned key is handled again, so the cutoff must outlive redelivery.
    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Result of [`IdempotencyGuard::record`].
#[derive(Debug, Clone)]
pub struct Recorded {
    /// False if the key was already recorded by an earlier delivery.
    pub created: bool,
    pub record: InboxRecord,
}

impl Recorded {
    /// Returns true if an earlier delivery already finished handling the key.
    pub fn is_duplicate(&self) -> bool {
        !self.created && self.record.is_processed()
    }
}

/// Outcome of [`IdempotencyGuard::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Processed,
    Duplicate,
}

/// Records each `(scope, action, key)` exactly once.
pub struct IdempotencyGuard<S> {
    store: S,
}

impl<S: InboxStore> IdempotencyGuard<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Inserts the triple or, if another delivery got there first, returns the
    /// existing record.
    #[tracing::instrument(skip(self, payload, clock))]
    pub async fn record(
        &self,
        scope: &str,
        action: &str,
        key: &str,
        payload: serde_json::Value,
        clock: &dyn Clock,
    ) -> Result<Recorded> {
        let record = InboxRecord::received(scope, action, key, payload, clock.now());
        match self.store.insert(record.clone()).await {
            Ok(()) => Ok(Recorded {
                created: true,
                record,
            }),
            Err(MessagingError::UniqueViolation { .. }) => {
                let existing = self.store.find(scope, action, key).await?.ok_or_else(|| {
                    MessagingError::NotFound {
                        entity: "inbox",
                        id: format!("{scope}/{action}/{key}"),
                    }
                })?;
                Ok(Recorded {
                    created: false,
                    record: existing,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `handler` at most once to completion per key.
    ///
    /// The handler receives the inbox record id and is expected to mark it
    /// processed inside its own aggregate transaction. A handler that loses
    /// that race to a concurrent redelivery reports `AlreadyProcessed`, which
    /// is treated as a duplicate. Any other failure leaves the record in
    /// `FAILED_RETRY` and is returned so the consumer redelivers.
    pub async fn handle<F, Fut, E>(
        &self,
        scope: &str,
        action: &str,
        key: &str,
        payload: serde_json::Value,
        clock: &dyn Clock,
        handler: F,
    ) -> std::result::Result<Handled, E>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<MessagingError> + AsMessagingError,
    {
        let recorded = self.record(scope, action, key, payload, clock).await?;
        if recorded.is_duplicate() {
            tracing::debug!(scope, action, key, "duplicate delivery skipped");
            metrics::counter!("inbox_duplicates_total").increment(1);
            return Ok(Handled::Duplicate);
        }

        let id = recorded.record.id;
        match handler(id).await {
            Ok(()) => Ok(Handled::Processed),
            Err(e) if matches!(e.as_messaging(), Some(MessagingError::AlreadyProcessed { .. })) => {
                metrics::counter!("inbox_duplicates_total").increment(1);
                Ok(Handled::Duplicate)
            }
            Err(e) => {
                match self.store.mark_failed_retry(id).await {
                    Ok(()) => {}
                    Err(MessagingError::AlreadyProcessed { .. }) => {
                        metrics::counter!("inbox_duplicates_total").increment(1);
                        return Ok(Handled::Duplicate);
                    }
                    Err(mark_err) => {
                        tracing::warn!(error = %mark_err, "failed to mark inbox record for retry");
                    }
                }
                Err(e)
            }
        }
    }
}

/// Lets the guard see through a service error to the messaging error inside.
pub trait AsMessagingError {
    fn as_messaging(&self) -> Option<&MessagingError>;
}

impl AsMessagingError for MessagingError {
    fn as_messaging(&self) -> Option<&MessagingError> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryDatabase, InboxTable, InboxTables};
    use common::ManualClock;

    #[derive(Debug, Clone, Default)]
    struct State {
        inbox: InboxTable,
    }

    impl InboxTables for State {
        fn inbox(&self) -> &InboxTable {
            &self.inbox
        }

        fn inbox_mut(&mut self) -> &mut InboxTable {
            &mut self.inbox
        }
    }

    fn guard() -> IdempotencyGuard<InMemoryDatabase<State>> {
        IdempotencyGuard::new(InMemoryDatabase::new(State::default()))
    }

    #[test]
    fn process_is_one_shot() {
        let mut r = InboxRecord::received("s", "a", "k", serde_json::Value::Null, Utc::now());
        r.process(Utc::now()).unwrap();
        assert!(matches!(
            r.process(Utc::now()),
            Err(MessagingError::AlreadyProcessed { .. })
        ));
        assert!(r.fail_retry().is_err());
    }

    #[tokio::test]
    async fn second_record_returns_existing_row() {
        let guard = guard();
        let clock = ManualClock::default();

        let first = guard
            .record("order", "place", "k-1", serde_json::json!({"n": 1}), &clock)
            .await
            .unwrap();
        let second = guard
            .record("order", "place", "k-1", serde_json::json!({"n": 2}), &clock)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.payload, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn same_key_in_other_scope_is_independent() {
        let guard = guard();
        let clock = ManualClock::default();
        let a = guard
            .record("order", "place", "k", serde_json::Value::Null, &clock)
            .await
            .unwrap();
        let b = guard
            .record("payment", "place", "k", serde_json::Value::Null, &clock)
            .await
            .unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.record.id, b.record.id);
    }

    #[tokio::test]
    async fn handled_delivery_is_skipped_on_redelivery() {
        let guard = guard();
        let clock = ManualClock::default();
        let mut runs = 0;

        for round in 0..3 {
            let outcome = guard
                .handle("inventory", "Reserve", "evt-1", serde_json::Value::Null, &clock, |id| {
                    runs += 1;
                    let store = guard.store().clone();
                    let now = clock.now();
                    async move { store.mark_processed(id, now).await }
                })
                .await
                .unwrap();
            let expected = if round == 0 {
                Handled::Processed
            } else {
                Handled::Duplicate
            };
            assert_eq!(outcome, expected);
        }
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn failed_handler_leaves_record_for_retry() {
        let guard = guard();
        let clock = ManualClock::default();

        let result = guard
            .handle("order", "Reply", "evt-2", serde_json::Value::Null, &clock, |_| async {
                Err(MessagingError::Publish("down".to_string()))
            })
            .await;
        assert!(result.is_err());

        let record = guard
            .store()
            .find("order", "Reply", "evt-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, InboxStatus::FailedRetry);
        assert_eq!(record.attempts, 1);

        let outcome = guard
            .handle("order", "Reply", "evt-2", serde_json::Value::Null, &clock, |id| {
                let store = guard.store().clone();
                let now = clock.now();
                async move { store.mark_processed(id, now).await }
            })
            .await
            .unwrap();
        assert_eq!(outcome, Handled::Processed);
    }
}
