//! Outbox persistence abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use herald_core::EventId;

use super::event::{OutboxEvent, OutboxStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxError {
    #[error("invalid outbox event: {0}")]
    Validation(String),

    #[error("outbox event not found: {0}")]
    NotFound(EventId),

    #[error("outbox event {id} is {status}")]
    InvalidState { id: EventId, status: OutboxStatus },

    #[error("outbox persistence error: {0}")]
    Persistence(String),
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: OutboxStatus, n: u64) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::Processing => self.processing += n,
            OutboxStatus::Processed => self.processed += n,
            OutboxStatus::Failed => self.failed += n,
            OutboxStatus::DeadLetter => self.dead_letter += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.processed + self.failed + self.dead_letter
    }
}

/// Storage for outbox rows.
///
/// Rows are only ever created through [`OutboxStore::insert`] on a caller-owned
/// transaction (`Tx`), so they commit or roll back together with the business
/// writes made on that same transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Unit of work shared with business writes. Dropping it without
    /// [`OutboxStore::commit`] discards everything written through it.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, OutboxError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), OutboxError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), OutboxError>;

    /// Stage a new `pending` row on `tx`.
    async fn insert(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), OutboxError>;

    /// Atomically move up to `limit` due `pending` rows (oldest `created_at`
    /// first) to `processing` and return them. Concurrent callers never
    /// receive the same row.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Persist the outcome of a processed batch in one transaction.
    ///
    /// Only rows still in `processing` are updated.
    async fn save_outcomes(&self, events: &[OutboxEvent]) -> Result<(), OutboxError>;

    /// Return `processing` rows claimed before `claimed_before` to `pending`.
    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Delete `processed` rows with `processed_at` before `cutoff`.
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Delete `dead_letter` and `failed` rows with `created_at` before `cutoff`.
    async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxError>;

    async fn find_by_aggregate(
        &self,
        aggregate_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn status_counts(&self) -> Result<StatusCounts, OutboxError>;

    /// Operator replay: a `dead_letter` row goes back to `pending` with
    /// `retry_count = 0`.
    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxEvent, OutboxError>;
}
