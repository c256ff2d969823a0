//! PostgreSQL outbox and inbox stores.
//!
//! Each service owns one `<service>_outbox` and one `<service>_inbox` table
//! (see `migrations/001_create_outbox_inbox.sql`). Records are written with
//! [`PostgresOutboxStore::enqueue`] on the caller's transaction so they commit
//! together with the aggregate change.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::error::{MessagingError, Result};
use crate::inbox::{InboxRecord, InboxStatus, InboxStore};
use crate::outbox::{OutboxRecord, OutboxStatus, OutboxStore};
use crate::retry::{RetryDecision, to_chrono};

const OUTBOX_COLUMNS: &str = "id, aggregate_id, event_type, idempotency_key, payload, status, \
     locked_by, locked_until, attempt_count, requeued_at_attempt, next_attempt_at, last_error, \
     created_at, updated_at, published_at";

const INBOX_COLUMNS: &str =
    "id, scope, action, idempotency_key, payload, status, attempts, received_at, processed_at";

/// Runs the outbox/inbox migrations.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

fn validate_table(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MessagingError::InvalidConfig(format!(
            "invalid table name '{table}'"
        )))
    }
}

fn map_unique(e: sqlx::Error, entity: &'static str) -> MessagingError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return MessagingError::UniqueViolation {
            entity,
            constraint: db_err.constraint().unwrap_or("unknown").to_string(),
        };
    }
    MessagingError::Database(e)
}

fn decode_error(column: &str, value: &str) -> MessagingError {
    MessagingError::Database(sqlx::Error::Decode(
        format!("unknown {column} '{value}'").into(),
    ))
}

/// PostgreSQL-backed outbox table.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    table: String,
}

impl PostgresOutboxStore {
    /// Creates a store over `table`, e.g. `order_outbox`.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a record on the caller's connection or transaction.
    pub async fn enqueue(&self, conn: &mut PgConnection, record: &OutboxRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({OUTBOX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            self.table
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(record.aggregate_id)
            .bind(&record.event_type)
            .bind(&record.idempotency_key)
            .bind(&record.payload)
            .bind(record.status.as_str())
            .bind(&record.locked_by)
            .bind(record.locked_until)
            .bind(record.attempt_count)
            .bind(record.requeued_at_attempt)
            .bind(record.next_attempt_at)
            .bind(&record.last_error)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.published_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_unique(e, "outbox"))?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;
        Ok(OutboxRecord {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            idempotency_key: row.try_get("idempotency_key")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::parse(&status)
                .ok_or_else(|| decode_error("outbox status", &status))?,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            attempt_count: row.try_get("attempt_count")?,
            requeued_at_attempt: row.try_get("requeued_at_attempt")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'PROCESSING', locked_by = $1, locked_until = $2, updated_at = $3
            WHERE id IN (
                SELECT id FROM {table}
                WHERE (
                    status IN ('PENDING', 'RETRY_SCHEDULED')
                    AND next_attempt_at <= $3
                    AND (locked_until IS NULL OR locked_until <= $3)
                ) OR (
                    status = 'PROCESSING' AND locked_until <= $3
                )
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#,
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now + to_chrono(lease))
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut records = rows
            .into_iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| (r.next_attempt_at, r.created_at));
        Ok(records)
    }

    async fn mark_published(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'PUBLISHED', published_at = $3, updated_at = $3,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (status, next_attempt_at) = match decision {
            RetryDecision::RetryAt {
                next_attempt_at, ..
            } => (OutboxStatus::RetryScheduled, Some(*next_attempt_at)),
            RetryDecision::Dead { .. } => (OutboxStatus::Dead, None),
        };
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $3, attempt_count = attempt_count + 1,
                next_attempt_at = COALESCE($4, next_attempt_at),
                last_error = $5, updated_at = $6,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(status.as_str())
            .bind(next_attempt_at)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'PENDING', requeued_at_attempt = attempt_count, next_attempt_at = $2,
                last_error = NULL, updated_at = $2, locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND status = 'DEAD'
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.find(id).await? {
            Some(record) => Err(MessagingError::InvalidStatus {
                entity: "outbox",
                id: id.to_string(),
                status: record.status.to_string(),
                action: "requeue",
            }),
            None => Err(MessagingError::NotFound {
                entity: "outbox",
                id: id.to_string(),
            }),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE status = $1", self.table);
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn prune_published(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE status = 'PUBLISHED' AND published_at <= $1",
            self.table
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

/// PostgreSQL-backed inbox table.
#[derive(Clone)]
pub struct PostgresInboxStore {
    pool: PgPool,
    table: String,
}

impl PostgresInboxStore {
    /// Creates a store over `table`, e.g. `inventory_inbox`.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self { pool, table })
    }

    /// Marks a record processed on the caller's transaction, alongside the
    /// aggregate change the event caused.
    pub async fn mark_processed_in(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'PROCESSED', processed_at = $2 \
             WHERE id = $1 AND status <> 'PROCESSED'",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        self.explain_miss(&mut *conn, id).await
    }

    async fn explain_miss(&self, conn: &mut PgConnection, id: Uuid) -> Result<()> {
        let sql = format!("SELECT status FROM {} WHERE id = $1", self.table);
        let status: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        match status {
            Some(_) => Err(MessagingError::AlreadyProcessed { id }),
            None => Err(MessagingError::NotFound {
                entity: "inbox",
                id: id.to_string(),
            }),
        }
    }

    fn row_to_record(row: PgRow) -> Result<InboxRecord> {
        let status: String = row.try_get("status")?;
        Ok(InboxRecord {
            id: row.try_get("id")?,
            scope: row.try_get("scope")?,
            action: row.try_get("action")?,
            idempotency_key: row.try_get("idempotency_key")?,
            payload: row.try_get("payload")?,
            status: InboxStatus::parse(&status)
                .ok_or_else(|| decode_error("inbox status", &status))?,
            attempts: row.try_get("attempts")?,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

#[async_trait]
impl InboxStore for PostgresInboxStore {
    async fn insert(&self, record: InboxRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({INBOX_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.scope)
            .bind(&record.action)
            .bind(&record.idempotency_key)
            .bind(&record.payload)
            .bind(record.status.as_str())
            .bind(record.attempts)
            .bind(record.received_at)
            .bind(record.processed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique(e, "inbox"))?;
        Ok(())
    }

    async fn find(&self, scope: &str, action: &str, key: &str) -> Result<Option<InboxRecord>> {
        let sql = format!(
            "SELECT {INBOX_COLUMNS} FROM {} \
             WHERE scope = $1 AND action = $2 AND idempotency_key = $3",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(scope)
            .bind(action)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.mark_processed_in(&mut *conn, id, now).await
    }

    async fn mark_failed_retry(&self, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'FAILED_RETRY', attempts = attempts + 1 \
             WHERE id = $1 AND status <> 'PROCESSED'",
            self.table
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        self.explain_miss(&mut *conn, id).await
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE status = 'PROCESSED' AND processed_at <= $1",
            self.table
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
