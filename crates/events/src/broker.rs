//! Broker abstraction the event bus runs against.
//!
//! The model is AMQP-shaped: exchanges route published messages to bound
//! queues by routing key, queues may dead-letter rejected or expired messages
//! to another exchange, and consumers receive deliveries that must be acked or
//! rejected. Implementations only need to honour these semantics; the bus never
//! looks at transport details.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use crate::routing::ExchangeKind;

/// Header carrying the reason a message was dead-lettered.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Header carrying the queue a message was dead-lettered from.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broker refused the operation (unknown exchange, queue limits, ...).
    #[error("broker rejected operation: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broker is closed")]
    Closed,
}

impl BrokerError {
    /// Whether the failure concerns the connection rather than the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}

/// A message as it travels over the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// 1-4, higher is delivered first.
    pub priority: u8,
    pub persistent: bool,
    /// Per-message expiration.
    pub expiration: Option<Duration>,
}

impl WireMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
            priority: 0,
            persistent: true,
            expiration: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message handed to a consumer; settle it with `ack` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: WireMessage,
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Messages older than this are dead-lettered (or dropped without a DLX).
    pub message_ttl: Option<Duration>,
    /// The queue is deleted after being unused this long.
    pub expires: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering; defaults to the message's own key.
    pub dead_letter_routing_key: Option<String>,
    pub max_priority: Option<u8>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            expires: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            max_priority: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }
}

/// Stream of deliveries for one queue subscription.
///
/// Ends (`next` returns `None`) when the broker closes or the subscription is
/// cancelled.
#[derive(Debug)]
pub struct Consumer {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(queue: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Message broker operations used by the event bus.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish to an exchange. Messages that match no binding are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError>;

    /// Subscribe to a queue with at most `prefetch` unsettled deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery; without requeue it is dead-lettered if the queue has a
    /// dead-letter exchange, otherwise dropped.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
