//! In-memory transactional storage.
//!
//! A service keeps all of its tables (aggregates, outbox, inbox) in one state
//! struct behind an [`InMemoryDatabase`]. A transaction runs against a copy of
//! that state and the copy replaces the original only if the transaction
//! returns `Ok`, so an aggregate change and its outbox record are committed
//! together or not at all.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::Version;

use crate::error::{MessagingError, Result};
use crate::inbox::{InboxKey, InboxRecord, InboxStore};
use crate::outbox::{OutboxRecord, OutboxStatus, OutboxStore};
use crate::retry::RetryDecision;

/// A row type stored in a [`Table`].
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Display + Debug + Send + Sync;

    /// Entity name used in error messages.
    const NAME: &'static str;

    fn id(&self) -> Self::Id;

    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Values that must be unique across the table, by constraint name.
    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// A versioned table with unique secondary indexes.
#[derive(Debug, Clone)]
pub struct Table<E: Entity> {
    rows: HashMap<E::Id, E>,
    unique: HashMap<&'static str, HashMap<String, E::Id>>,
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            unique: HashMap::new(),
        }
    }
}

impl<E: Entity> Table<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new row at version 1.
    pub fn insert(&mut self, mut entity: E) -> Result<E> {
        let id = entity.id();
        if self.rows.contains_key(&id) {
            return Err(MessagingError::UniqueViolation {
                entity: E::NAME,
                constraint: "primary_key".to_string(),
            });
        }
        let keys = entity.unique_keys();
        for (constraint, key) in &keys {
            if self
                .unique
                .get(constraint)
                .is_some_and(|index| index.contains_key(key))
            {
                return Err(MessagingError::UniqueViolation {
                    entity: E::NAME,
                    constraint: constraint.to_string(),
                });
            }
        }

        for (constraint, key) in keys {
            self.unique
                .entry(constraint)
                .or_default()
                .insert(key, id.clone());
        }
        entity.set_version(Version::first());
        self.rows.insert(id, entity.clone());
        Ok(entity)
    }

    /// Replaces a row if its stored version still matches the entity's.
    ///
    /// The stored row and the returned copy carry the bumped version.
    pub fn update(&mut self, mut entity: E) -> Result<E> {
        let id = entity.id();
        let current = self.rows.get(&id).ok_or_else(|| MessagingError::NotFound {
            entity: E::NAME,
            id: id.to_string(),
        })?;

        let expected = entity.version();
        if current.version() != expected {
            return Err(MessagingError::ConcurrencyConflict {
                entity: E::NAME,
                id: id.to_string(),
                expected,
                actual: current.version(),
            });
        }

        let old_keys = current.unique_keys();
        let new_keys = entity.unique_keys();
        for (constraint, key) in &new_keys {
            if let Some(owner) = self.unique.get(constraint).and_then(|index| index.get(key)) {
                if *owner != id {
                    return Err(MessagingError::UniqueViolation {
                        entity: E::NAME,
                        constraint: constraint.to_string(),
                    });
                }
            }
        }
        for (constraint, key) in old_keys {
            if let Some(index) = self.unique.get_mut(constraint) {
                index.remove(&key);
            }
        }
        for (constraint, key) in new_keys {
            self.unique
                .entry(constraint)
                .or_default()
                .insert(key, id.clone());
        }

        entity.set_version(expected.next());
        self.rows.insert(id, entity.clone());
        Ok(entity)
    }

    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.rows.get(id)
    }

    /// Loads a row or fails with `NotFound`.
    pub fn load(&self, id: &E::Id) -> Result<E> {
        self.rows
            .get(id)
            .cloned()
            .ok_or_else(|| MessagingError::NotFound {
                entity: E::NAME,
                id: id.to_string(),
            })
    }

    /// Looks a row up by a unique constraint.
    pub fn find_unique(&self, constraint: &str, key: &str) -> Option<&E> {
        self.unique
            .get(constraint)
            .and_then(|index| index.get(key))
            .and_then(|id| self.rows.get(id))
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A service's outbox table.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    records: Vec<OutboxRecord>,
    keys: HashSet<String>,
}

impl OutboxTable {
    /// Inserts a record; its idempotency key must be new.
    pub fn insert(&mut self, record: OutboxRecord) -> Result<()> {
        if !self.keys.insert(record.idempotency_key.clone()) {
            return Err(MessagingError::UniqueViolation {
                entity: "outbox",
                constraint: "outbox_idempotency_key".to_string(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Claims up to `limit` records, oldest schedule first.
    pub fn claim(
        &mut self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Vec<OutboxRecord> {
        let mut candidates: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| (self.records[i].next_attempt_at, self.records[i].created_at));

        candidates
            .into_iter()
            .take(limit)
            .map(|i| {
                let record = &mut self.records[i];
                record.claim(worker_id, lease, now);
                record.clone()
            })
            .collect()
    }

    pub fn mark_published(&mut self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> bool {
        match self.held_mut(id, worker_id) {
            Some(record) => {
                record.complete(now);
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(
        &mut self,
        id: Uuid,
        worker_id: &str,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.held_mut(id, worker_id) {
            Some(record) => {
                record.fail(decision, error, now);
                true
            }
            None => false,
        }
    }

    pub fn requeue_dead(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| MessagingError::NotFound {
                entity: "outbox",
                id: id.to_string(),
            })?
            .requeue(now)
    }

    pub fn find(&self, id: Uuid) -> Option<&OutboxRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn count_by_status(&self, status: OutboxStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Drops records published at or before `cutoff`, freeing their keys.
    pub fn prune_published(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let keys = &mut self.keys;
        self.records.retain(|record| {
            let expired = record.status == OutboxStatus::Published
                && record.published_at.is_some_and(|at| at <= cutoff);
            if expired {
                keys.remove(&record.idempotency_key);
            }
            !expired
        });
        before - self.records.len()
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn held_mut(&mut self, id: Uuid, worker_id: &str) -> Option<&mut OutboxRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id && r.is_held_by(worker_id))
    }
}

/// A service's inbox table.
#[derive(Debug, Clone, Default)]
pub struct InboxTable {
    records: HashMap<InboxKey, InboxRecord>,
    by_id: HashMap<Uuid, InboxKey>,
}

impl InboxTable {
    /// Inserts a record; its `(scope, action, key)` must be new.
    pub fn insert(&mut self, record: InboxRecord) -> Result<()> {
        let key = record.key();
        if self.records.contains_key(&key) {
            return Err(MessagingError::UniqueViolation {
                entity: "inbox",
                constraint: "inbox_scope_action_key".to_string(),
            });
        }
        self.by_id.insert(record.id, key.clone());
        self.records.insert(key, record);
        Ok(())
    }

    pub fn find(&self, scope: &str, action: &str, key: &str) -> Option<&InboxRecord> {
        self.records.get(&InboxKey::new(scope, action, key))
    }

    pub fn get(&self, id: Uuid) -> Option<&InboxRecord> {
        self.by_id.get(&id).and_then(|key| self.records.get(key))
    }

    pub fn mark_processed(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)?.process(now)
    }

    pub fn mark_failed_retry(&mut self, id: Uuid) -> Result<()> {
        self.get_mut(id)?.fail_retry()
    }

    /// Drops records processed at or before `cutoff`.
    pub fn prune_processed(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let by_id = &mut self.by_id;
        self.records.retain(|_, record| {
            let expired = record.processed_at.is_some_and(|at| at <= cutoff);
            if expired {
                by_id.remove(&record.id);
            }
            !expired
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut InboxRecord> {
        self.by_id
            .get(&id)
            .and_then(|key| self.records.get_mut(key))
            .ok_or_else(|| MessagingError::NotFound {
                entity: "inbox",
                id: id.to_string(),
            })
    }
}

/// State structs that own an outbox table.
pub trait OutboxTables {
    fn outbox(&self) -> &OutboxTable;
    fn outbox_mut(&mut self) -> &mut OutboxTable;
}

/// State structs that own an inbox table.
pub trait InboxTables {
    fn inbox(&self) -> &InboxTable;
    fn inbox_mut(&mut self) -> &mut InboxTable;
}

/// Shared, transactional in-memory state.
#[derive(Debug, Default)]
pub struct InMemoryDatabase<T> {
    state: Arc<RwLock<T>>,
}

impl<T> Clone for InMemoryDatabase<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync> InMemoryDatabase<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Runs `f` against a copy of the state and commits the copy on `Ok`.
    ///
    /// Transactions are serialized; a failed one leaves no trace.
    pub async fn transaction<R, E, F>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut T) -> std::result::Result<R, E>,
    {
        let mut guard = self.state.write().await;
        let mut draft = guard.clone();
        let result = f(&mut draft)?;
        *guard = draft;
        Ok(result)
    }

    /// Runs a read-only query against the committed state.
    pub async fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.state.read().await;
        f(&guard)
    }

    /// Mutates the committed state in place. `f` must not fail halfway.
    async fn write<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.state.write().await;
        f(&mut guard)
    }
}

#[async_trait]
impl<T> OutboxStore for InMemoryDatabase<T>
where
    T: OutboxTables + Clone + Send + Sync,
{
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .write(|state| state.outbox_mut().claim(worker_id, limit, lease, now))
            .await)
    }

    async fn mark_published(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .write(|state| state.outbox_mut().mark_published(id, worker_id, now))
            .await)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .write(|state| {
                state
                    .outbox_mut()
                    .mark_failed(id, worker_id, decision, error, now)
            })
            .await)
    }

    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.write(|state| state.outbox_mut().requeue_dead(id, now))
            .await
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        Ok(self.read(|state| state.outbox().find(id).cloned()).await)
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<usize> {
        Ok(self
            .read(|state| state.outbox().count_by_status(status))
            .await)
    }

    async fn prune_published(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .write(|state| state.outbox_mut().prune_published(cutoff))
            .await)
    }
}

#[async_trait]
impl<T> InboxStore for InMemoryDatabase<T>
where
    T: InboxTables + Clone + Send + Sync,
{
    async fn insert(&self, record: InboxRecord) -> Result<()> {
        self.write(|state| state.inbox_mut().insert(record)).await
    }

    async fn find(&self, scope: &str, action: &str, key: &str) -> Result<Option<InboxRecord>> {
        Ok(self
            .read(|state| state.inbox().find(scope, action, key).cloned())
            .await)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.write(|state| state.inbox_mut().mark_processed(id, now))
            .await
    }

    async fn mark_failed_retry(&self, id: Uuid) -> Result<()> {
        self.write(|state| state.inbox_mut().mark_failed_retry(id))
            .await
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .write(|state| state.inbox_mut().prune_processed(cutoff))
            .await)
    }
}
