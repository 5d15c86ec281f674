//! Event bus: breaker-protected publishing and retrying consumers.
//!
//! ## Topology
//!
//! For every consumed queue `q` the bus declares:
//!
//! ```text
//! exchange ──(routing keys)──▶ q ──(reject / expire)──▶ dead-letter exchange ──(q)──▶ q.dead_letter
//!                              ▲
//!   retry exchange ──(q)───────┘
//!        ▲
//!        └──(ttl expiry)── q.delay.<millis> ◀──(q.delay.<millis>)── delay exchange
//! ```
//!
//! A failed delivery is republished to a per-delay queue whose TTL equals the
//! retry delay; on expiry the broker dead-letters it through the retry exchange
//! back onto `q`. Redelivery is therefore explicit and counted in the envelope,
//! never left to broker requeueing.
//!
//! ## Delivery guarantees
//!
//! At-least-once. A handler can see the same `event_id` more than once (outbox
//! retries after an ambiguous publish, or a crash between handling and ack), so
//! handlers must be idempotent.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use herald_core::Backoff;
use herald_observability::{Counter, LatencySnapshot, LatencyStats};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitOpenError};
use crate::broker::{Broker, BrokerError, Consumer, Delivery, ExchangeKind, QueueSpec, WireMessage};
use crate::envelope::{Envelope, EnvelopeError};
use crate::handler::EventHandler;

pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_SOURCE_SERVICE: &str = "source_service";
pub const HEADER_EVENT_VERSION: &str = "event_version";

/// Configuration for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Exchange used when a publish does not name one.
    pub default_exchange: String,
    pub dead_letter_exchange: String,
    pub retry_exchange: String,
    pub delay_exchange: String,
    /// Maximum unsettled deliveries (and concurrent handler runs) per queue.
    pub prefetch_count: u16,
    /// Consumer retry delay: `min(base * multiplier^retry_count, max)`.
    pub retry_backoff: Backoff,
    /// Message TTL of `<queue>.dead_letter` queues.
    pub dead_letter_ttl: Duration,
    /// Idle expiry of `<queue>.dead_letter` queues.
    pub dead_letter_expires: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            default_exchange: "herald.events".to_string(),
            dead_letter_exchange: "herald.dead_letter".to_string(),
            retry_exchange: "herald.retry".to_string(),
            delay_exchange: "herald.delay".to_string(),
            prefetch_count: 10,
            retry_backoff: Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(300)),
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            dead_letter_expires: Duration::from_secs(14 * 24 * 60 * 60),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EventBusConfig {
    pub fn with_default_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.default_exchange = exchange.into();
        self
    }

    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_dead_letter_retention(mut self, ttl: Duration, expires: Duration) -> Self {
        self.dead_letter_ttl = ttl;
        self.dead_letter_expires = expires;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Delay before redelivering an envelope whose (already incremented)
    /// retry count is `retry_count`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_backoff
            .delay_for_attempt(retry_count.saturating_add(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("event bus is shut down")]
    ShutDown,
}

/// Anything that can publish envelopes; the outbox processor depends on this
/// rather than on a concrete bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// `Ok(true)` when the broker accepted the message, `Ok(false)` when it
    /// refused it, `Err` on connection failure or an open circuit.
    async fn publish(
        &self,
        envelope: &Envelope,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> Result<bool, EventBusError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(
        &self,
        envelope: &Envelope,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> Result<bool, EventBusError> {
        (**self).publish(envelope, routing_key, exchange).await
    }
}

/// How a consumed delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// No handler registered for the event type.
    Dropped,
    Retried { delay: Duration },
    DeadLettered,
    /// The retry republish failed; the original went back to the queue.
    Requeued,
    Malformed,
}

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub published: Counter,
    pub publish_rejected: Counter,
    pub publish_failed: Counter,
    pub consumed: Counter,
    pub retried: Counter,
    pub dead_lettered: Counter,
    pub malformed: Counter,
    pub handler_latency: LatencyStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub publish_rejected: u64,
    pub publish_failed: u64,
    pub consumed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    pub handler_latency: LatencySnapshot,
}

impl BusMetrics {
    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published.get(),
            publish_rejected: self.publish_rejected.get(),
            publish_failed: self.publish_failed.get(),
            consumed: self.consumed.get(),
            retried: self.retried.get(),
            dead_lettered: self.dead_lettered.get(),
            malformed: self.malformed.get(),
            handler_latency: self.handler_latency.snapshot(),
        }
    }
}

type HandlerMap = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// Publishes envelopes and runs consumer handlers against a [`Broker`].
pub struct EventBus<B: Broker> {
    broker: Arc<B>,
    config: Arc<EventBusConfig>,
    breaker: Arc<CircuitBreaker>,
    handlers: Arc<RwLock<HandlerMap>>,
    metrics: Arc<BusMetrics>,
    shutdown: watch::Sender<bool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Broker> std::fmt::Debug for EventBus<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

impl<B: Broker> EventBus<B> {
    pub fn new(broker: Arc<B>, config: EventBusConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "event_bus.publish",
            config.circuit_breaker.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            config: Arc::new(config),
            breaker,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(BusMetrics::default()),
            shutdown,
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Breaker guarding publishes.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    /// Declare the default, dead-letter, retry and delay exchanges. Idempotent.
    pub async fn setup(&self) -> Result<(), EventBusError> {
        let cfg = &self.config;
        self.broker
            .declare_exchange(&cfg.default_exchange, ExchangeKind::Topic)
            .await?;
        for exchange in [&cfg.dead_letter_exchange, &cfg.retry_exchange, &cfg.delay_exchange] {
            self.broker
                .declare_exchange(exchange, ExchangeKind::Direct)
                .await?;
        }
        Ok(())
    }

    /// Declare an additional topic exchange for publishes that name one.
    pub async fn declare_exchange(&self, exchange: &str) -> Result<(), EventBusError> {
        self.broker
            .declare_exchange(exchange, ExchangeKind::Topic)
            .await?;
        Ok(())
    }

    /// Register a handler for every event type it declares.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for event_type in handler.event_types() {
            debug!(handler = handler.name(), event_type = %event_type, "handler registered");
            handlers
                .entry(event_type)
                .or_default()
                .push(Arc::clone(&handler));
        }
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Publish through the circuit breaker.
    ///
    /// Broker refusals are reported as `Ok(false)` and count as breaker
    /// successes; only connection failures trip the breaker.
    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id(), event_type = envelope.event_type())
    )]
    pub async fn publish(
        &self,
        envelope: &Envelope,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> Result<bool, EventBusError> {
        if *self.shutdown.borrow() {
            return Err(EventBusError::ShutDown);
        }
        let exchange = exchange.unwrap_or(self.config.default_exchange.as_str());
        let message = to_wire(envelope)?;
        let broker = &self.broker;

        let result = self
            .breaker
            .call(|| async move {
                match broker.publish(exchange, routing_key, message).await {
                    Ok(()) => Ok(true),
                    Err(err) if !err.is_connection() => {
                        warn!(exchange, routing_key, error = %err, "broker rejected publish");
                        Ok(false)
                    }
                    Err(err) => Err(err),
                }
            })
            .await;

        match result {
            Ok(true) => {
                self.metrics.published.inc();
                debug!(exchange, routing_key, "event published");
                Ok(true)
            }
            Ok(false) => {
                self.metrics.publish_rejected.inc();
                Ok(false)
            }
            Err(CircuitError::Open(err)) => {
                self.metrics.publish_failed.inc();
                Err(err.into())
            }
            Err(CircuitError::Failed(err)) => {
                self.metrics.publish_failed.inc();
                warn!(exchange, routing_key, error = %err, "publish failed");
                Err(err.into())
            }
        }
    }

    /// Declare the queue topology for `queue` and start a consumer task for it.
    pub async fn start_consuming(
        &self,
        queue: &str,
        routing_keys: &[&str],
        exchange: Option<&str>,
    ) -> Result<(), EventBusError> {
        if *self.shutdown.borrow() {
            return Err(EventBusError::ShutDown);
        }
        self.setup().await?;
        let cfg = &self.config;
        let exchange = exchange.unwrap_or(cfg.default_exchange.as_str());
        if exchange != cfg.default_exchange {
            self.declare_exchange(exchange).await?;
        }

        let dead_letter_queue = format!("{queue}.dead_letter");
        self.broker
            .declare_queue(
                QueueSpec::new(&dead_letter_queue)
                    .with_message_ttl(cfg.dead_letter_ttl)
                    .with_expires(cfg.dead_letter_expires),
            )
            .await?;
        self.broker
            .bind_queue(&dead_letter_queue, &cfg.dead_letter_exchange, queue)
            .await?;

        self.broker
            .declare_queue(
                QueueSpec::new(queue)
                    .with_dead_letter(&cfg.dead_letter_exchange, Some(queue.to_string()))
                    .with_max_priority(4),
            )
            .await?;
        for routing_key in routing_keys {
            self.broker.bind_queue(queue, exchange, routing_key).await?;
        }
        self.broker
            .bind_queue(queue, &cfg.retry_exchange, queue)
            .await?;

        let consumer = self.broker.consume(queue, cfg.prefetch_count).await?;
        let worker = QueueWorker {
            queue: queue.to_string(),
            broker: Arc::clone(&self.broker),
            config: Arc::clone(&self.config),
            handlers: Arc::clone(&self.handlers),
            metrics: Arc::clone(&self.metrics),
        };
        let span = info_span!("consumer", queue = %queue);
        let handle = tokio::spawn(worker.run(consumer, self.shutdown.subscribe()).instrument(span));
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        info!(queue, exchange, ?routing_keys, "consumer started");
        Ok(())
    }

    /// Stop consumers, wait for in-flight handlers, then close the broker.
    pub async fn shutdown(&self) -> Result<(), EventBusError> {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "consumer task ended abnormally");
            }
        }
        self.broker.close().await?;
        info!("event bus shut down");
        Ok(())
    }
}

#[async_trait]
impl<B: Broker> EventPublisher for EventBus<B> {
    async fn publish(
        &self,
        envelope: &Envelope,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> Result<bool, EventBusError> {
        EventBus::publish(self, envelope, routing_key, exchange).await
    }
}

fn to_wire(envelope: &Envelope) -> Result<WireMessage, EnvelopeError> {
    let metadata = envelope.metadata();
    let mut message = WireMessage::new(envelope.to_vec()?)
        .with_priority(metadata.priority.as_u8())
        .with_expiration(envelope.ttl());
    message.headers = metadata.headers.clone();
    message
        .headers
        .insert(HEADER_EVENT_TYPE.to_string(), envelope.event_type().to_string());
    message
        .headers
        .insert(HEADER_SOURCE_SERVICE.to_string(), metadata.source_service.clone());
    message
        .headers
        .insert(HEADER_EVENT_VERSION.to_string(), metadata.version.clone());
    Ok(message)
}

/// Per-queue consumer state shared with the spawned task.
struct QueueWorker<B: Broker> {
    queue: String,
    broker: Arc<B>,
    config: Arc<EventBusConfig>,
    handlers: Arc<RwLock<HandlerMap>>,
    metrics: Arc<BusMetrics>,
}

impl<B: Broker> QueueWorker<B> {
    async fn run(self, mut consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
        let worker = Arc::new(self);
        let limit = Arc::new(Semaphore::new(usize::from(worker.config.prefetch_count.max(1))));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "delivery task failed");
                    }
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    let Ok(permit) = Arc::clone(&limit).acquire_owned().await else { break };
                    let worker = Arc::clone(&worker);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(delivery).await;
                    });
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "delivery task failed");
            }
        }
        debug!(queue = %worker.queue, "consumer loop exited");
    }

    async fn process(&self, delivery: Delivery) -> DeliveryOutcome {
        self.metrics.consumed.inc();
        let envelope = match Envelope::from_slice(&delivery.message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(queue = %self.queue, tag = delivery.tag, error = %err, "malformed envelope rejected");
                self.metrics.malformed.inc();
                self.settle_reject(&delivery, false).await;
                return DeliveryOutcome::Malformed;
            }
        };

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(envelope.event_type())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                queue = %self.queue,
                event_type = envelope.event_type(),
                event_id = %envelope.event_id(),
                "no handler registered, dropping"
            );
            self.settle_ack(&delivery).await;
            return DeliveryOutcome::Dropped;
        }

        let started = Instant::now();
        let results = join_all(handlers.iter().map(|handler| {
            let envelope = &envelope;
            async move {
                match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some(format!("handler '{}' panicked", handler.name())),
                }
            }
        }))
        .await;
        self.metrics.handler_latency.record(started.elapsed());

        let failures: Vec<String> = results.into_iter().flatten().collect();
        if failures.is_empty() {
            self.settle_ack(&delivery).await;
            return DeliveryOutcome::Acked;
        }

        let Some(next) = envelope.next_attempt() else {
            warn!(
                queue = %self.queue,
                event_id = %envelope.event_id(),
                retry_count = envelope.retry_count(),
                errors = ?failures,
                "retries exhausted, dead-lettering"
            );
            self.metrics.dead_lettered.inc();
            self.settle_reject(&delivery, false).await;
            return DeliveryOutcome::DeadLettered;
        };

        let delay = self.config.retry_delay(next.retry_count());
        match self.schedule_retry(&next, delay).await {
            Ok(()) => {
                info!(
                    queue = %self.queue,
                    event_id = %next.event_id(),
                    retry_count = next.retry_count(),
                    delay_ms = delay.as_millis() as u64,
                    errors = ?failures,
                    "handler failed, retry scheduled"
                );
                self.metrics.retried.inc();
                self.settle_ack(&delivery).await;
                DeliveryOutcome::Retried { delay }
            }
            Err(err) => {
                error!(
                    queue = %self.queue,
                    event_id = %next.event_id(),
                    error = %err,
                    "retry republish failed, requeueing original"
                );
                self.settle_reject(&delivery, true).await;
                DeliveryOutcome::Requeued
            }
        }
    }

    async fn schedule_retry(&self, next: &Envelope, delay: Duration) -> Result<(), EventBusError> {
        let cfg = &self.config;
        let delay_queue = format!("{}.delay.{}", self.queue, delay.as_millis());
        self.broker
            .declare_queue(
                QueueSpec::new(&delay_queue)
                    .with_message_ttl(delay)
                    .with_dead_letter(&cfg.retry_exchange, Some(self.queue.clone())),
            )
            .await?;
        self.broker
            .bind_queue(&delay_queue, &cfg.delay_exchange, &delay_queue)
            .await?;
        self.broker
            .publish(&cfg.delay_exchange, &delay_queue, to_wire(next)?)
            .await?;
        Ok(())
    }

    async fn settle_ack(&self, delivery: &Delivery) {
        if let Err(err) = self.broker.ack(delivery).await {
            warn!(queue = %self.queue, tag = delivery.tag, error = %err, "ack failed");
        }
    }

    async fn settle_reject(&self, delivery: &Delivery, requeue: bool) {
        if let Err(err) = self.broker.reject(delivery, requeue).await {
            warn!(queue = %self.queue, tag = delivery.tag, requeue, error = %err, "reject failed");
        }
    }
}
