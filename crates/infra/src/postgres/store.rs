//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! `claim_pending` selects ready rows with `FOR UPDATE SKIP LOCKED` inside a
//! single `UPDATE ... RETURNING` statement. Concurrent relays (threads or
//! separate processes) therefore never receive the same row: a row locked by
//! one claimer is skipped by the others rather than waited on.
//!
//! ## Transitions
//!
//! Every transition out of `sending` is one guarded `UPDATE ... WHERE status =
//! 'sending' AND locked_by = $worker`. When it touches no row, a follow-up
//! read distinguishes an unknown id (`NotFound`), an entry in the wrong state
//! (`InvalidTransition`) and an entry now claimed by another worker
//! (`LeaseLost`). Retry budget arithmetic happens in SQL, where the `SET`
//! clause sees the pre-update `retry_count`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) | `23505` | `Storage` (enqueue reports `Duplicate` instead) |
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument, warn, Span};

use steward_core::{Clock, EntryId, SystemClock, WorkerId};
use steward_outbox::{
    retry_delay, truncate_error, EnqueueOutcome, OutboxEntry, OutboxError, OutboxJob,
    OutboxStats, OutboxStatus, OutboxStore, RetryOutcome, LEASE_EXPIRED, MAX_RETRY,
};

/// Schema applied by [`PgOutboxStore::migrate`].
pub const OUTBOX_MIGRATION: &str = include_str!("../../migrations/0001_create_outbox_entries.sql");

const ENTRY_COLUMNS: &str = "id, queue, job_type, payload, dedup_key, status, available_at, \
     retry_count, last_error, locked_by, locked_at, created_at";

/// Outbox store over a shared connection pool.
///
/// Timestamps written by the store come from its [`Clock`], so a relay and
/// its store agree on "now" even when the database clock drifts.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    max_retry: u32,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            max_retry: MAX_RETRY,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::raw_sql(OUTBOX_MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Enqueue inside the caller's business transaction.
    ///
    /// The row becomes visible to relays only when `tx` commits and vanishes
    /// if it rolls back. A uniqueness collision is reported as `Duplicate`
    /// without aborting `tx`.
    #[instrument(
        skip(self, tx, job),
        fields(queue = %job.queue, job_type = %job.job_type, entry_id = %job.id),
        err
    )]
    pub async fn enqueue_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: OutboxJob,
    ) -> Result<EnqueueOutcome, OutboxError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_entries (
                id, queue, job_type, payload, dedup_key,
                status, available_at, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.dedup_key)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        if result.rows_affected() == 0 {
            info!(dedup_key = ?job.dedup_key, "duplicate outbox enqueue ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }
        Ok(EnqueueOutcome::Enqueued(job.id))
    }

    /// Move a `sending` entry to a terminal status.
    async fn finish(
        &self,
        operation: &str,
        id: EntryId,
        worker: &WorkerId,
        to: OutboxStatus,
        error: Option<&str>,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = $2,
                last_error = COALESCE($3, last_error),
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'sending' AND locked_by = $4
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(error.map(truncate_error))
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, worker, to).await);
        }
        Ok(())
    }

    /// Explain why a guarded transition matched no row.
    async fn transition_error(
        &self,
        id: EntryId,
        worker: &WorkerId,
        to: OutboxStatus,
    ) -> OutboxError {
        let row = sqlx::query("SELECT status, locked_by FROM outbox_entries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return OutboxError::NotFound(id),
            Err(e) => return map_sqlx_error("transition_error", e),
        };
        let status: String = match row.try_get("status") {
            Ok(status) => status,
            Err(e) => return map_sqlx_error("transition_error", e),
        };
        let locked_by: Option<String> = match row.try_get("locked_by") {
            Ok(locked_by) => locked_by,
            Err(e) => return map_sqlx_error("transition_error", e),
        };

        match OutboxStatus::from_str(&status) {
            Ok(OutboxStatus::Sending) if locked_by.as_deref() != Some(worker.as_str()) => {
                OutboxError::LeaseLost {
                    id,
                    worker: worker.clone(),
                }
            }
            Ok(from) => OutboxError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }

    async fn fetch_entries(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_entry).collect()
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    #[instrument(skip(self, job), fields(queue = %job.queue, entry_id = %job.id), err)]
    async fn enqueue(&self, job: OutboxJob) -> Result<EnqueueOutcome, OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let outcome = self.enqueue_in(&mut tx, job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self, worker), fields(worker = %worker, claimed = tracing::field::Empty), err)]
    async fn claim_pending(
        &self,
        queue: &str,
        batch_size: usize,
        worker: &WorkerId,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let sql = format!(
            r#"
            WITH ready AS (
                SELECT id
                FROM outbox_entries
                WHERE queue = $1 AND status = 'pending' AND available_at <= $2
                ORDER BY available_at ASC, created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_entries AS e
            SET status = 'sending', locked_by = $4, locked_at = $2
            FROM ready
            WHERE e.id = ready.id
            RETURNING {columns}
            "#,
            columns = qualified_columns("e")
        );

        let query = sqlx::query(&sql)
            .bind(queue)
            .bind(now)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(worker.as_str());
        let mut claimed = self.fetch_entries("claim_pending", query).await?;

        // RETURNING does not preserve the CTE order.
        claimed.sort_by_key(|e| (e.available_at, e.created_at, e.id));
        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, worker), fields(entry_id = %id, worker = %worker), err)]
    async fn mark_completed(&self, id: EntryId, worker: &WorkerId) -> Result<(), OutboxError> {
        self.finish("mark_completed", id, worker, OutboxStatus::Sent, None)
            .await
    }

    #[instrument(skip(self, worker, error), fields(entry_id = %id, worker = %worker), err)]
    async fn schedule_retry(
        &self,
        id: EntryId,
        worker: &WorkerId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, OutboxError> {
        let now = self.clock.now();
        let row = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = CASE WHEN retry_count >= $2 THEN 'dead_letter' ELSE 'pending' END,
                retry_count = CASE WHEN retry_count >= $2 THEN retry_count ELSE retry_count + 1 END,
                available_at = CASE WHEN retry_count >= $2 THEN available_at ELSE $3 END,
                last_error = $4,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'sending' AND locked_by = $5
            RETURNING status, retry_count, available_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(budget(self.max_retry))
        .bind(now + retry_delay(delay))
        .bind(truncate_error(error))
        .bind(worker.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", e))?;

        let Some(row) = row else {
            return Err(self.transition_error(id, worker, OutboxStatus::Pending).await);
        };

        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("schedule_retry", e))?;
        if OutboxStatus::from_str(&status)? == OutboxStatus::DeadLetter {
            return Ok(RetryOutcome::DeadLettered);
        }

        let retry_count: i32 = row
            .try_get("retry_count")
            .map_err(|e| map_sqlx_error("schedule_retry", e))?;
        let available_at: DateTime<Utc> = row
            .try_get("available_at")
            .map_err(|e| map_sqlx_error("schedule_retry", e))?;
        Ok(RetryOutcome::Rescheduled {
            retry_count: retry_count.max(0) as u32,
            available_at,
        })
    }

    #[instrument(skip(self, worker, error), fields(entry_id = %id, worker = %worker), err)]
    async fn mark_dead_letter(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        self.finish("mark_dead_letter", id, worker, OutboxStatus::DeadLetter, Some(error))
            .await
    }

    #[instrument(skip(self, worker, error), fields(entry_id = %id, worker = %worker), err)]
    async fn mark_failed(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        self.finish("mark_failed", id, worker, OutboxStatus::Failed, Some(error))
            .await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(&self, queue: &str, lease: Duration) -> Result<usize, OutboxError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let rows = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = CASE WHEN retry_count >= $3 THEN 'dead_letter' ELSE 'pending' END,
                retry_count = CASE WHEN retry_count >= $3 THEN retry_count ELSE retry_count + 1 END,
                available_at = CASE WHEN retry_count >= $3 THEN available_at ELSE $4 END,
                last_error = $5,
                locked_by = NULL,
                locked_at = NULL
            WHERE queue = $1 AND status = 'sending' AND locked_at < $2
            RETURNING id, status
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .bind(budget(self.max_retry))
        .bind(now + retry_delay(Duration::ZERO))
        .bind(LEASE_EXPIRED)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        for row in &rows {
            let id: uuid::Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
            warn!(entry_id = %id, %status, "reclaimed outbox entry with expired lease");
        }
        Ok(rows.len())
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get(&self, id: EntryId) -> Result<Option<OutboxEntry>, OutboxError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_entry).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        queue: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM outbox_entries
            WHERE queue = $1 AND status = $2
            ORDER BY available_at ASC, created_at ASC
            LIMIT $3
            "#
        );
        let query = sqlx::query(&sql)
            .bind(queue)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        self.fetch_entries("list_by_status", query).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: &str) -> Result<OutboxStats, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM outbox_entries
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let count = total.max(0) as usize;
            match OutboxStatus::from_str(&status)? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Sending => stats.sending = count,
                OutboxStatus::Sent => stats.sent = count,
                OutboxStatus::Failed => stats.failed = count,
                OutboxStatus::DeadLetter => stats.dead_letter = count,
            }
        }
        Ok(stats)
    }
}

fn budget(max_retry: u32) -> i32 {
    i32::try_from(max_retry).unwrap_or(i32::MAX)
}

fn qualified_columns(alias: &str) -> String {
    ENTRY_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map SQLx errors to OutboxError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let detail = match db_err.code().as_deref() {
                Some("23505") => "unique violation",
                Some("23514") => "check constraint violation",
                _ => "database error",
            };
            OutboxError::Storage(format!(
                "{detail} in {operation}: {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => OutboxError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    queue: String,
    job_type: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    status: String,
    available_at: DateTime<Utc>,
    retry_count: i32,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            dedup_key: row.try_get("dedup_key")?,
            status: row.try_get("status")?,
            available_at: row.try_get("available_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let locked_by = row
            .locked_by
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| OutboxError::Storage(format!("invalid locked_by: {e}")))?;

        Ok(OutboxEntry {
            id: EntryId::from_uuid(row.id),
            queue: row.queue,
            job_type: row.job_type,
            payload: row.payload,
            dedup_key: row.dedup_key,
            status: OutboxStatus::from_str(&row.status)?,
            available_at: row.available_at,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
            locked_by,
            locked_at: row.locked_at,
            created_at: row.created_at,
        })
    }
}

fn decode_entry(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let row = OutboxRow::from_row(row)
        .map_err(|e| OutboxError::Storage(format!("failed to deserialize outbox row: {e}")))?;
    OutboxEntry::try_from(row)
}
