//! Outbox row model and its lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use herald_core::{Backoff, EventId, Priority};
use herald_events::{Envelope, EnvelopeError};

use super::store::OutboxError;

/// Header carrying the outbox row's aggregate id.
pub const HEADER_AGGREGATE_ID: &str = "aggregate_id";
/// Header carrying the outbox row's partition key, when set.
pub const HEADER_PARTITION_KEY: &str = "partition_key";

/// Lifecycle status of an outbox row.
///
/// `pending → processing → processed | pending (retry) | dead_letter`.
/// `failed` is never produced by the processor; it exists for rows marked
/// terminal by operators and is removed by cleanup like `dead_letter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Processed,
        Self::Failed,
        Self::DeadLetter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::DeadLetter)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OutboxError::Persistence(format!("unknown outbox status '{s}'")))
    }
}

/// A persisted outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub correlation_id: Option<String>,
    pub source_service: String,
    pub routing_key: String,
    pub exchange_name: Option<String>,
    pub priority: Priority,
    pub partition_key: Option<String>,

    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the row last entered `processing`.
    pub claimed_at: Option<DateTime<Utc>>,
}

/// What happened to a claimed row after a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Processed,
    Retry { next_retry_at: DateTime<Utc> },
    DeadLettered,
}

impl OutboxEvent {
    /// Whether the row can be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.claimed_at = Some(now);
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> PublishOutcome {
        self.status = OutboxStatus::Processed;
        self.processed_at = Some(now);
        self.next_retry_at = None;
        PublishOutcome::Processed
    }

    /// Record a failed publish attempt.
    ///
    /// The row returns to `pending` with a backoff delay while
    /// `retry_count < max_retries`, and becomes `dead_letter` otherwise, so a
    /// pending row never carries `retry_count == max_retries`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        backoff: &Backoff,
    ) -> PublishOutcome {
        self.retry_count = self.retry_count.saturating_add(1);
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.into());

        if self.retry_count < self.max_retries {
            let next_retry_at = now + backoff.chrono_delay_for_attempt(self.retry_count);
            self.status = OutboxStatus::Pending;
            self.next_retry_at = Some(next_retry_at);
            PublishOutcome::Retry { next_retry_at }
        } else {
            self.status = OutboxStatus::DeadLetter;
            self.next_retry_at = None;
            PublishOutcome::DeadLettered
        }
    }

    /// Return a stuck `processing` row to `pending` without counting a retry.
    pub fn release(&mut self) {
        self.status = OutboxStatus::Pending;
        self.claimed_at = None;
    }

    /// Operator replay of a dead-lettered row.
    pub fn requeue(&mut self) -> Result<(), OutboxError> {
        if self.status != OutboxStatus::DeadLetter {
            return Err(OutboxError::InvalidState {
                id: self.id,
                status: self.status,
            });
        }
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.claimed_at = None;
        Ok(())
    }

    /// Build the envelope published for this row.
    ///
    /// The envelope shares the row id, so consumers can deduplicate on
    /// `event_id`. Its retry counter starts at zero; consumer redeliveries are
    /// counted separately from outbox publish retries.
    pub fn to_envelope(&self) -> Result<Envelope, EnvelopeError> {
        let mut builder = Envelope::builder(
            self.event_type.clone(),
            self.payload.clone(),
            self.source_service.clone(),
        )
        .event_id(self.id)
        .correlation_id(self.correlation_id.clone())
        .timestamp(self.created_at)
        .priority(self.priority)
        .max_retries(self.max_retries)
        .header(HEADER_AGGREGATE_ID, self.aggregate_id.clone());
        if let Some(partition_key) = &self.partition_key {
            builder = builder.header(HEADER_PARTITION_KEY, partition_key.clone());
        }
        builder.build()
    }
}

/// Producer input for a new outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub routing_key: String,
    pub exchange_name: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Priority,
    /// Falls back to the outbox default when unset.
    pub max_retries: Option<u32>,
    pub partition_key: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            routing_key: routing_key.into(),
            exchange_name: None,
            correlation_id: None,
            priority: Priority::Normal,
            max_retries: None,
            partition_key: None,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Validate and turn into a `pending` row.
    pub fn into_event(
        self,
        source_service: &str,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, OutboxError> {
        for (field, value) in [
            ("aggregate_id", &self.aggregate_id),
            ("event_type", &self.event_type),
            ("routing_key", &self.routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(OutboxError::Validation(format!("{field} must not be empty")));
            }
        }
        if source_service.trim().is_empty() {
            return Err(OutboxError::Validation("source_service must not be empty".into()));
        }

        Ok(OutboxEvent {
            id: EventId::new(),
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            correlation_id: self.correlation_id,
            source_service: source_service.to_string(),
            routing_key: self.routing_key,
            exchange_name: self.exchange_name,
            priority: self.priority,
            partition_key: self.partition_key,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            error_count: 0,
            last_error: None,
            created_at: now,
            processed_at: None,
            next_retry_at: None,
            claimed_at: None,
        })
    }
}
