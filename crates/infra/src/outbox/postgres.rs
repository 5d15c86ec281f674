//! Postgres-backed outbox store.
//!
//! Rows live in `outbox_events` (see `migrations/0001_create_outbox_events.sql`).
//! Claims run `SELECT ... FOR UPDATE SKIP LOCKED` inside the claiming
//! transaction, so several processor replicas can poll the same table without
//! ever claiming the same row twice.
//!
//! ## Error Mapping
//!
//! Every SQLx error becomes `OutboxError::Persistence` with the failing
//! operation in the message; unique violations (`23505`) on insert are reported
//! as `OutboxError::Validation` since they indicate a reused event id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use herald_core::{EventId, Priority};

use super::event::{OutboxEvent, OutboxStatus};
use super::store::{OutboxError, OutboxStore, StatusCounts};

const MIGRATION: &str = include_str!("../../migrations/0001_create_outbox_events.sql");

const COLUMNS: &str = "id, aggregate_id, event_type, payload, correlation_id, source_service, \
     routing_key, exchange_name, priority, partition_key, status, retry_count, max_retries, \
     error_count, last_error, created_at, processed_at, next_retry_at, claimed_at";

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

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn fetch_where(
        &self,
        operation: &str,
        clause: &str,
        binds: &[&str],
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_events WHERE {clause} ORDER BY created_at, id");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        decode_rows(rows)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, OutboxError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), OutboxError> {
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), OutboxError> {
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }

    #[instrument(
        skip(self, tx, event),
        fields(event_id = %event.id, aggregate_id = %event.aggregate_id, event_type = %event.event_type),
        err
    )]
    async fn insert(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_id, event_type, payload, correlation_id, source_service,
                routing_key, exchange_name, priority, partition_key, status, retry_count,
                max_retries, error_count, last_error, created_at, processed_at,
                next_retry_at, claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.correlation_id)
        .bind(&event.source_service)
        .bind(&event.routing_key)
        .bind(&event.exchange_name)
        .bind(i16::from(event.priority.as_u8()))
        .bind(&event.partition_key)
        .bind(event.status.as_str())
        .bind(to_i32(event.retry_count))
        .bind(to_i32(event.max_retries))
        .bind(to_i32(event.error_count))
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.processed_at)
        .bind(event.next_retry_at)
        .bind(event.claimed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            UPDATE outbox_events
            SET status = 'processing', claimed_at = $1
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;
        self.commit(tx).await?;

        let mut events = decode_rows(rows)?;
        events.sort_by_key(|event| (event.created_at, event.id));
        debug!(claimed = events.len(), "outbox batch claimed");
        Ok(events)
    }

    #[instrument(skip(self, events), fields(batch = events.len()), err)]
    async fn save_outcomes(&self, events: &[OutboxEvent]) -> Result<(), OutboxError> {
        let mut tx = self.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = $2, retry_count = $3, error_count = $4, last_error = $5,
                    processed_at = $6, next_retry_at = $7, claimed_at = $8
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(event.id.as_uuid())
            .bind(event.status.as_str())
            .bind(to_i32(event.retry_count))
            .bind(to_i32(event.error_count))
            .bind(&event.last_error)
            .bind(event.processed_at)
            .bind(event.next_retry_at)
            .bind(event.claimed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save_outcomes", e))?;
        }
        self.commit(tx).await
    }

    #[instrument(skip(self), err)]
    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < $1)
            "#,
        )
        .bind(claimed_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'processed' AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_processed_before", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status IN ('dead_letter', 'failed') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_failed_before", e))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|row| OutboxRow::from_row(&row).and_then(OutboxEvent::try_from))
            .transpose()
            .map_err(|e| map_sqlx_error("decode", e))
    }

    async fn find_by_aggregate(
        &self,
        aggregate_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        match event_type {
            Some(event_type) => {
                self.fetch_where(
                    "find_by_aggregate",
                    "aggregate_id = $1 AND event_type = $2",
                    &[aggregate_id, event_type],
                )
                .await
            }
            None => {
                self.fetch_where("find_by_aggregate", "aggregate_id = $1", &[aggregate_id])
                    .await
            }
        }
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.fetch_where("find_by_correlation", "correlation_id = $1", &[correlation_id])
            .await
    }

    async fn status_counts(&self) -> Result<StatusCounts, OutboxError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("decode", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("decode", e))?;
            counts.add(status.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxEvent, OutboxError> {
        let sql = format!(
            r#"
            UPDATE outbox_events
            SET status = 'pending', retry_count = 0, next_retry_at = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'dead_letter'
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        match row {
            Some(row) => OutboxRow::from_row(&row)
                .and_then(OutboxEvent::try_from)
                .map_err(|e| map_sqlx_error("decode", e)),
            None => match self.get(id).await? {
                Some(existing) => Err(OutboxError::InvalidState {
                    id,
                    status: existing.status,
                }),
                None => Err(OutboxError::NotFound(id)),
            },
        }
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<OutboxEvent>, OutboxError> {
    rows.iter()
        .map(|row| OutboxRow::from_row(row).and_then(OutboxEvent::try_from))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode", e))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => OutboxError::Validation(msg),
                _ => OutboxError::Persistence(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Persistence(format!("connection pool closed in {}", operation))
        }
        _ => OutboxError::Persistence(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
    correlation_id: Option<String>,
    source_service: String,
    routing_key: String,
    exchange_name: Option<String>,
    priority: i16,
    partition_key: Option<String>,
    status: String,
    retry_count: i32,
    max_retries: i32,
    error_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            correlation_id: row.try_get("correlation_id")?,
            source_service: row.try_get("source_service")?,
            routing_key: row.try_get("routing_key")?,
            exchange_name: row.try_get("exchange_name")?,
            priority: row.try_get("priority")?,
            partition_key: row.try_get("partition_key")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_count: row.try_get("error_count")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = sqlx::Error;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let decode = |msg: String| sqlx::Error::Decode(msg.into());
        let count = |value: i32, column: &str| {
            u32::try_from(value).map_err(|_| decode(format!("negative {column}: {value}")))
        };

        let priority = u8::try_from(row.priority)
            .ok()
            .and_then(|p| Priority::try_from(p).ok())
            .ok_or_else(|| decode(format!("invalid priority {}", row.priority)))?;
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| decode(e.to_string()))?;

        Ok(OutboxEvent {
            id: EventId::from_uuid(row.id),
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            correlation_id: row.correlation_id,
            source_service: row.source_service,
            routing_key: row.routing_key,
            exchange_name: row.exchange_name,
            priority,
            partition_key: row.partition_key,
            status,
            retry_count: count(row.retry_count, "retry_count")?,
            max_retries: count(row.max_retries, "max_retries")?,
            error_count: count(row.error_count, "error_count")?,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
            next_retry_at: row.next_retry_at,
            claimed_at: row.claimed_at,
        })
    }
}
