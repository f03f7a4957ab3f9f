//! Postgres-backed outbox store.
//!
//! ## Claim protocol
//!
//! `claim_next` runs one transaction per attempt:
//!
//! 1. `SELECT id ... WHERE status IN ('pending', 'failed') ORDER BY occurred_on
//!    LIMIT 1 FOR UPDATE SKIP LOCKED`. Rows locked by another worker are
//!    skipped rather than waited on; no row means rollback and `None`.
//! 2. `UPDATE ... SET status = 'processing', attempt_count = attempt_count + 1,
//!    last_attempt_at = NOW()` on that row, still inside the transaction.
//! 3. `COMMIT`.
//!
//! The attempt is durable before the dispatcher is ever called.
//!
//! Settles are fenced on the claim: the `UPDATE` also matches the claimed
//! `attempt_count` and `last_attempt_at`, so a worker whose claim was reaped
//! and handed to someone else gets `ClaimLost` instead of overwriting it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (undefined table) | `42P01` | `SchemaMissing` |
//! | Database (connection failures) | class `08` | `Unavailable` |
//! | Database (other) | Any other | `Storage` |
//! | Io / Tls / PoolTimedOut / PoolClosed / WorkerCrashed | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shopworks_core::MessageId;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{OutboxStats, OutboxStore, OutboxStoreError};
use crate::message::{ClaimToken, NewOutboxMessage, OutboxMessage, OutboxStatus};

const COLUMNS: &str =
    "id, aggregate_id, message_type, payload, status, attempt_count, occurred_on, last_attempt_at, last_error";

/// Idempotent DDL for the outbox table and its claim index. The migration
/// file is the only copy; `ensure_schema` runs it as-is.
const SCHEMA: &str = include_str!("../../migrations/0001_outbox_messages.sql");

/// Outbox store over a shared connection pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its claim index if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Write a `Pending` row inside the producer's own transaction, so the
    /// message exists iff the domain change commits.
    #[instrument(
        skip(tx, message),
        fields(message_id = %message.id, message_type = %message.message_type),
        err
    )]
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        message: &NewOutboxMessage,
    ) -> Result<OutboxMessage, OutboxStoreError> {
        let row = sqlx::query(&insert_sql())
            .bind(message.id.as_uuid())
            .bind(&message.aggregate_id)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.occurred_on)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        decode(&row)
    }

    async fn settle(
        &self,
        operation: &'static str,
        claim: &ClaimToken,
        next: OutboxStatus,
        error: Option<&str>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2, last_error = $3
            WHERE id = $1
              AND status = 'processing'
              AND attempt_count = $4
              AND last_attempt_at IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(claim.id.as_uuid())
        .bind(next.as_str())
        .bind(error)
        .bind(i32::try_from(claim.attempt).unwrap_or(i32::MAX))
        .bind(claim.claimed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.explain_settle_miss(claim, next).await)
    }

    /// Turn a zero-row settle into `NotFound`, `ClaimLost` or `InvalidTransition`.
    async fn explain_settle_miss(&self, claim: &ClaimToken, to: OutboxStatus) -> OutboxStoreError {
        match self.get(claim.id).await {
            Ok(None) => OutboxStoreError::NotFound(claim.id),
            Ok(Some(current)) if !current.holds(claim) => OutboxStoreError::ClaimLost {
                id: claim.id,
                attempt: claim.attempt,
            },
            Ok(Some(current)) => OutboxStoreError::InvalidTransition {
                id: claim.id,
                from: current.status,
                to,
            },
            Err(e) => e,
        }
    }

    /// Turn a zero-row update into `NotFound` or `InvalidTransition`.
    async fn explain_miss(&self, operation: &str, id: MessageId, to: OutboxStatus) -> OutboxStoreError {
        let current: Result<Option<String>, _> =
            sqlx::query_scalar("SELECT status FROM outbox_messages WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;

        match current {
            Ok(None) => OutboxStoreError::NotFound(id),
            Ok(Some(status)) => match status.parse::<OutboxStatus>() {
                Ok(from) => OutboxStoreError::InvalidTransition { id, from, to },
                Err(e) => OutboxStoreError::Storage(e.to_string()),
            },
            Err(e) => map_sqlx_error(operation, e),
        }
    }
}

fn insert_sql() -> String {
    format!(
        "INSERT INTO outbox_messages (id, aggregate_id, message_type, payload, occurred_on, status, attempt_count) \
         VALUES ($1, $2, $3, $4, $5, 'pending', 0) RETURNING {COLUMNS}"
    )
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, message), fields(message_id = %message.id), err)]
    async fn insert(&self, message: NewOutboxMessage) -> Result<OutboxMessage, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        let row = Self::insert_in_tx(&mut tx, &message).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("insert", e))?;
        Ok(row)
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM outbox_messages
            WHERE status IN ('pending', 'failed')
            ORDER BY occurred_on ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(id) = candidate else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        };

        let row = sqlx::query(&format!(
            "UPDATE outbox_messages \
             SET status = 'processing', attempt_count = attempt_count + 1, last_attempt_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        decode(&row).map(Some)
    }

    #[instrument(skip(self, claim), fields(message_id = %claim.id, attempt = claim.attempt), err)]
    async fn mark_sent(&self, claim: &ClaimToken) -> Result<(), OutboxStoreError> {
        self.settle("mark_sent", claim, OutboxStatus::Sent, None).await
    }

    #[instrument(skip(self, claim, error), fields(message_id = %claim.id, attempt = claim.attempt), err)]
    async fn mark_failed(&self, claim: &ClaimToken, error: &str) -> Result<(), OutboxStoreError> {
        self.settle("mark_failed", claim, OutboxStatus::Failed, Some(error))
            .await
    }

    #[instrument(skip(self, claim, reason), fields(message_id = %claim.id, attempt = claim.attempt), err)]
    async fn mark_dead_letter(&self, claim: &ClaimToken, reason: &str) -> Result<(), OutboxStoreError> {
        self.settle("mark_dead_letter", claim, OutboxStatus::DeadLetter, Some(reason))
            .await
    }

    #[instrument(skip(self), fields(older_than_secs = older_than.as_secs()), err)]
    async fn reset_stale_claims(&self, older_than: Duration) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', last_error = 'claim expired'
            WHERE status = 'processing'
              AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stale_claims", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn requeue_dead_letter(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE outbox_messages \
             SET status = 'pending', attempt_count = 0, last_error = NULL \
             WHERE id = $1 AND status = 'dead_letter' \
             RETURNING {COLUMNS}"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        match row {
            Some(row) => decode(&row),
            None => Err(self
                .explain_miss("requeue_dead_letter", id, OutboxStatus::Pending)
                .await),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_messages \
             WHERE status = 'dead_letter' \
             ORDER BY last_attempt_at DESC NULLS LAST \
             LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), err)]
    async fn counts_by_status(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*)::BIGINT AS count FROM outbox_messages GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts_by_status", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("counts_by_status", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("counts_by_status", e))?;
            let status = status
                .parse::<OutboxStatus>()
                .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Map SQLx errors to `OutboxStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => OutboxStoreError::SchemaMissing(msg),
                Some(code) if code.starts_with("08") => OutboxStoreError::Unavailable(msg),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => OutboxStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => OutboxStoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::PoolTimedOut => {
            OutboxStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::WorkerCrashed => {
            OutboxStoreError::Unavailable(format!("connection worker crashed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxStoreError> {
    let row = OutboxRow::from_row(row)
        .map_err(|e| OutboxStoreError::Storage(format!("failed to decode outbox row: {}", e)))?;
    row.try_into()
}

#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: String,
    message_type: String,
    payload: Vec<u8>,
    status: String,
    attempt_count: i32,
    occurred_on: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            message_type: row.try_get("message_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            occurred_on: row.try_get("occurred_on")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.id),
            aggregate_id: row.aggregate_id,
            message_type: row.message_type,
            payload: row.payload,
            status,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            occurred_on: row.occurred_on,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
        })
    }
}
