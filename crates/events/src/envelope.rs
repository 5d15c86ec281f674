use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use herald_core::{EventId, Priority};

/// Envelope format version written into every message.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Errors raised when building or decoding an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Invalid(String),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize envelope: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Delivery metadata carried next to the event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source_service: String,
    pub version: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Message time-to-live in seconds (broker `expiration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EnvelopeMetadata {
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            correlation_id: None,
            timestamp: Utc::now(),
            source_service: source_service.into(),
            version: ENVELOPE_VERSION.to_string(),
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: 3,
            ttl_seconds: None,
            headers: BTreeMap::new(),
        }
    }
}

/// In-flight message: event type, opaque JSON data, and delivery metadata.
///
/// Envelopes are validated when built and when decoded from the wire, so a held
/// `Envelope` always has a non-empty event type and source service and a
/// `retry_count` that does not exceed `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    event_type: String,
    data: JsonValue,
    metadata: EnvelopeMetadata,
}

#[derive(Deserialize)]
struct RawEnvelope {
    event_type: String,
    data: JsonValue,
    metadata: EnvelopeMetadata,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        Envelope::new(raw.event_type, raw.data, raw.metadata)
    }
}

impl Envelope {
    pub fn new(
        event_type: impl Into<String>,
        data: JsonValue,
        metadata: EnvelopeMetadata,
    ) -> Result<Self, EnvelopeError> {
        let envelope = Self {
            event_type: event_type.into(),
            data,
            metadata,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn builder(
        event_type: impl Into<String>,
        data: JsonValue,
        source_service: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            event_type: event_type.into(),
            data,
            metadata: EnvelopeMetadata::new(source_service),
        }
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::Invalid("event_type must not be empty".into()));
        }
        if self.metadata.source_service.trim().is_empty() {
            return Err(EnvelopeError::Invalid("source_service must not be empty".into()));
        }
        if self.metadata.version.trim().is_empty() {
            return Err(EnvelopeError::Invalid("version must not be empty".into()));
        }
        if self.metadata.retry_count > self.metadata.max_retries {
            return Err(EnvelopeError::Invalid(format!(
                "retry_count {} exceeds max_retries {}",
                self.metadata.retry_count, self.metadata.max_retries
            )));
        }
        Ok(())
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn event_id(&self) -> EventId {
        self.metadata.event_id
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.metadata.max_retries
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.metadata.ttl_seconds.map(Duration::from_secs)
    }

    /// Whether another delivery attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.metadata.retry_count < self.metadata.max_retries
    }

    /// Copy of this envelope for the next delivery attempt.
    ///
    /// Returns `None` once `max_retries` has been reached.
    pub fn next_attempt(&self) -> Option<Envelope> {
        if !self.can_retry() {
            return None;
        }
        let mut next = self.clone();
        next.metadata.retry_count += 1;
        Some(next)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialize)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Deserialize)
    }

    pub fn into_parts(self) -> (String, JsonValue, EnvelopeMetadata) {
        (self.event_type, self.data, self.metadata)
    }
}

/// Builder for [`Envelope`]; validation happens in [`EnvelopeBuilder::build`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    event_type: String,
    data: JsonValue,
    metadata: EnvelopeMetadata,
}

impl EnvelopeBuilder {
    pub fn event_id(mut self, event_id: EventId) -> Self {
        self.metadata.event_id = event_id;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.metadata.retry_count = retry_count;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = max_retries;
        self
    }

    /// Time to live on the wire, in whole seconds; a fractional second rounds
    /// up so a short TTL never becomes an immediate expiry.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        let round_up = u64::from(ttl.subsec_nanos() > 0);
        self.metadata.ttl_seconds = Some(ttl.as_secs().saturating_add(round_up));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        Envelope::new(self.event_type, self.data, self.metadata)
    }
}
