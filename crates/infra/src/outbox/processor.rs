//! Outbox processor: drains `pending` rows through an [`EventPublisher`].
//!
//! Each poll claims a batch, publishes every row independently and then
//! persists all outcomes in one store call. A row that fails to publish never
//! blocks the rest of its batch; it is either scheduled for a later retry or
//! dead-lettered once it runs out of retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use herald_core::Backoff;
use herald_events::EventPublisher;
use herald_observability::{Counter, Gauge, LatencySnapshot, LatencyStats};

use super::event::{OutboxEvent, PublishOutcome};
use super::store::{OutboxError, OutboxStore};

/// Outbox processing and cleanup configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Written into every row and envelope as `source_service`.
    pub source_service: String,
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Delay schedule between publish retries of one row.
    pub backoff: Backoff,
    /// Used for rows created without an explicit `max_retries`.
    pub default_max_retries: u32,
    pub cleanup_interval: Duration,
    /// How long `processed` rows are kept.
    pub processed_retention: Duration,
    /// How long `dead_letter` and `failed` rows are kept.
    pub failed_retention: Duration,
    /// A `processing` row older than this is assumed abandoned by a crashed
    /// processor and goes back to `pending`.
    pub processing_timeout: Duration,
    /// Upper bound on one publish; a publish that exceeds it counts as failed.
    pub publish_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            source_service: "herald".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            backoff: Backoff::default(),
            default_max_retries: 3,
            cleanup_interval: Duration::from_secs(3600),
            processed_retention: Duration::from_secs(7 * 24 * 3600),
            failed_retention: Duration::from_secs(30 * 24 * 3600),
            processing_timeout: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl OutboxConfig {
    pub fn with_source_service(mut self, source_service: impl Into<String>) -> Self {
        self.source_service = source_service.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_retention(mut self, processed: Duration, failed: Duration) -> Self {
        self.processed_retention = processed;
        self.failed_retention = failed;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Counters shared by the processor and the cleanup loop.
#[derive(Debug, Default)]
pub struct OutboxMetrics {
    /// `pending` rows after the last poll.
    pub queue_depth: Gauge,
    pub processed: Counter,
    pub retried: Counter,
    pub dead_lettered: Counter,
    pub publish_failures: Counter,
    pub cleanup_deleted: Counter,
    pub stale_released: Counter,
    pub store_errors: Counter,
    pub batch_latency: LatencyStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutboxMetricsSnapshot {
    pub queue_depth: i64,
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub publish_failures: u64,
    pub cleanup_deleted: u64,
    pub stale_released: u64,
    pub store_errors: u64,
    pub batch_latency: LatencySnapshot,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> OutboxMetricsSnapshot {
        OutboxMetricsSnapshot {
            queue_depth: self.queue_depth.get(),
            processed: self.processed.get(),
            retried: self.retried.get(),
            dead_lettered: self.dead_lettered.get(),
            publish_failures: self.publish_failures.get(),
            cleanup_deleted: self.cleanup_deleted.get(),
            stale_released: self.stale_released.get(),
            store_errors: self.store_errors.get(),
            batch_latency: self.batch_latency.snapshot(),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct OutboxProcessor<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: OutboxConfig,
    metrics: Arc<OutboxMetrics>,
}

impl<S, P> std::fmt::Debug for OutboxProcessor<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, P> OutboxProcessor<S, P>
where
    S: OutboxStore,
    P: EventPublisher + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: OutboxConfig) -> Self {
        Self::with_metrics(store, publisher, config, Arc::new(OutboxMetrics::default()))
    }

    /// Share a metrics instance, typically with [`super::OutboxCleanup`].
    pub fn with_metrics(
        store: Arc<S>,
        publisher: Arc<P>,
        config: OutboxConfig,
        metrics: Arc<OutboxMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<OutboxMetrics> {
        &self.metrics
    }

    /// Claim, publish and settle one batch.
    ///
    /// Store failures are returned; publish failures are recorded on the rows.
    #[instrument(skip(self), fields(source_service = %self.config.source_service), err)]
    pub async fn process_batch(&self) -> Result<BatchReport, OutboxError> {
        let started = Instant::now();
        let mut batch = self
            .store
            .claim_batch(self.config.batch_size, Utc::now())
            .await?;

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        if batch.is_empty() {
            self.refresh_queue_depth().await;
            return Ok(report);
        }

        for event in &mut batch {
            match self.publish_one(event).await {
                PublishOutcome::Processed => report.processed += 1,
                PublishOutcome::Retry { .. } => report.retried += 1,
                PublishOutcome::DeadLettered => report.dead_lettered += 1,
            }
        }

        // Rows stay `processing` if this fails; the stale reaper returns them.
        self.store.save_outcomes(&batch).await?;

        self.metrics.processed.add(report.processed as u64);
        self.metrics.retried.add(report.retried as u64);
        self.metrics.dead_lettered.add(report.dead_lettered as u64);
        self.metrics.batch_latency.record(started.elapsed());
        self.refresh_queue_depth().await;

        debug!(
            claimed = report.claimed,
            processed = report.processed,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "outbox batch settled"
        );
        Ok(report)
    }

    async fn publish_one(&self, event: &mut OutboxEvent) -> PublishOutcome {
        let attempt = match event.to_envelope() {
            Ok(envelope) => {
                let publish = self.publisher.publish(
                    &envelope,
                    &event.routing_key,
                    event.exchange_name.as_deref(),
                );
                match tokio::time::timeout(self.config.publish_timeout, publish).await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err("broker rejected publish".to_string()),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!(
                        "publish timed out after {}ms",
                        self.config.publish_timeout.as_millis()
                    )),
                }
            }
            Err(err) => Err(format!("invalid envelope: {err}")),
        };

        let now = Utc::now();
        let error = match attempt {
            Ok(()) => return event.mark_processed(now),
            Err(error) => error,
        };

        self.metrics.publish_failures.inc();
        let outcome = event.record_failure(error, now, &self.config.backoff);
        match outcome {
            PublishOutcome::Retry { next_retry_at } => warn!(
                event_id = %event.id,
                aggregate_id = %event.aggregate_id,
                routing_key = %event.routing_key,
                retry_count = event.retry_count,
                %next_retry_at,
                error = event.last_error.as_deref().unwrap_or_default(),
                "outbox publish failed, retry scheduled"
            ),
            PublishOutcome::DeadLettered => error!(
                event_id = %event.id,
                aggregate_id = %event.aggregate_id,
                routing_key = %event.routing_key,
                retry_count = event.retry_count,
                error = event.last_error.as_deref().unwrap_or_default(),
                "outbox event dead-lettered"
            ),
            PublishOutcome::Processed => {}
        }
        outcome
    }

    async fn refresh_queue_depth(&self) {
        match self.store.status_counts().await {
            Ok(counts) => self
                .metrics
                .queue_depth
                .set(i64::try_from(counts.pending).unwrap_or(i64::MAX)),
            Err(err) => {
                self.metrics.store_errors.inc();
                debug!(error = %err, "queue depth refresh failed");
            }
        }
    }

    /// Poll every `poll_interval` until `shutdown` flips to `true`.
    ///
    /// A batch in progress is finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            source_service = %self.config.source_service,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox processor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.process_batch().await {
                        self.metrics.store_errors.inc();
                        warn!(error = %err, "outbox poll failed");
                    }
                }
            }
        }
        info!("outbox processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::{NewOutboxEvent, OutboxStatus};
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use async_trait::async_trait;
    use herald_events::{BrokerError, Envelope, EventBusError};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Publisher that replays a script of results, then succeeds.
    #[derive(Default)]
    struct ScriptedPublisher {
        script: Mutex<VecDeque<Result<bool, ()>>>,
        published: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl ScriptedPublisher {
        fn with_script(script: impl IntoIterator<Item = Result<bool, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<(String, String, Option<String>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for ScriptedPublisher {
        async fn publish(
            &self,
            envelope: &Envelope,
            routing_key: &str,
            exchange: Option<&str>,
        ) -> Result<bool, EventBusError> {
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(true));
            match next {
                Ok(true) => {
                    self.published.lock().unwrap().push((
                        envelope.event_type().to_string(),
                        routing_key.to_string(),
                        exchange.map(str::to_string),
                    ));
                    Ok(true)
                }
                Ok(false) => Ok(false),
                Err(()) => Err(BrokerError::Connection("connection refused".into()).into()),
            }
        }
    }

    fn config() -> OutboxConfig {
        OutboxConfig::default()
            .with_source_service("orders")
            .with_backoff(Backoff::new(Duration::ZERO, 2.0, Duration::ZERO))
    }

    async fn seed(store: &InMemoryOutboxStore, new: NewOutboxEvent) -> OutboxEvent {
        let event = new.into_event("orders", 3, Utc::now()).unwrap();
        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, &event).await.unwrap();
        store.commit(tx).await.unwrap();
        event
    }

    #[tokio::test]
    async fn publishes_pending_rows_with_their_routing() {
        let store = InMemoryOutboxStore::arc();
        let publisher = ScriptedPublisher::with_script([]);
        let event = seed(
            &store,
            NewOutboxEvent::new("order-1", "order.created", json!({"total": 10}), "orders.created")
                .with_exchange("orders"),
        )
        .await;

        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), config());
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.processed, 1);
        let row = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Processed);
        assert!(row.processed_at.is_some());
        assert_eq!(
            publisher.published(),
            vec![(
                "order.created".to_string(),
                "orders.created".to_string(),
                Some("orders".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn rejection_and_connection_errors_schedule_retries() {
        let store = InMemoryOutboxStore::arc();
        let publisher = ScriptedPublisher::with_script([Ok(false), Err(())]);
        let first = seed(&store, NewOutboxEvent::new("a", "order.created", json!({}), "k")).await;
        let second = seed(&store, NewOutboxEvent::new("b", "order.created", json!({}), "k")).await;

        let processor = OutboxProcessor::new(
            store.clone(),
            publisher,
            config().with_backoff(Backoff::new(
                Duration::from_secs(60),
                2.0,
                Duration::from_secs(600),
            )),
        );
        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.retried, 2);

        for id in [first.id, second.id] {
            let row = store.get(id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Pending);
            assert_eq!(row.retry_count, 1);
            assert!(row.next_retry_at.unwrap() > Utc::now());
        }
        assert!(store.get(first.id).await.unwrap().unwrap().last_error.unwrap().contains("rejected"));

        // Not due yet.
        assert_eq!(processor.process_batch().await.unwrap().claimed, 0);
        assert_eq!(processor.metrics().snapshot().queue_depth, 2);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let store = InMemoryOutboxStore::arc();
        let publisher = ScriptedPublisher::with_script([Err(())]);
        for aggregate in ["a", "b", "c"] {
            seed(&store, NewOutboxEvent::new(aggregate, "order.created", json!({}), "k")).await;
        }

        let processor = OutboxProcessor::new(store.clone(), publisher, config());
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report, BatchReport { claimed: 3, processed: 2, retried: 1, dead_lettered: 0 });
        let snapshot = processor.metrics().snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.batch_latency.count, 1);
    }

    /// Publisher whose first publish never completes.
    #[derive(Default)]
    struct StallingPublisher {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EventPublisher for StallingPublisher {
        async fn publish(
            &self,
            _envelope: &Envelope,
            _routing_key: &str,
            _exchange: Option<&str>,
        ) -> Result<bool, EventBusError> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn hung_publish_times_out_without_stalling_the_batch() {
        let store = InMemoryOutboxStore::arc();
        let first = seed(&store, NewOutboxEvent::new("a", "order.created", json!({}), "k")).await;
        let second = seed(&store, NewOutboxEvent::new("b", "order.created", json!({}), "k")).await;

        let processor = OutboxProcessor::new(
            store.clone(),
            Arc::new(StallingPublisher::default()),
            config().with_publish_timeout(Duration::from_millis(20)),
        );
        let report = tokio::time::timeout(Duration::from_secs(1), processor.process_batch())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.retried, 1);
        let mut timed_out = 0;
        for id in [first.id, second.id] {
            let row = store.get(id).await.unwrap().unwrap();
            if row.status == OutboxStatus::Pending {
                assert!(row.last_error.unwrap().contains("timed out"));
                timed_out += 1;
            } else {
                assert_eq!(row.status, OutboxStatus::Processed);
            }
        }
        assert_eq!(timed_out, 1);
    }

    #[tokio::test]
    async fn zero_retry_budget_dead_letters_immediately() {
        let store = InMemoryOutboxStore::arc();
        let publisher = ScriptedPublisher::with_script([Err(())]);
        let event = seed(
            &store,
            NewOutboxEvent::new("a", "order.created", json!({}), "k").with_max_retries(0),
        )
        .await;

        let processor = OutboxProcessor::new(store.clone(), publisher, config());
        processor.process_batch().await.unwrap();

        let row = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::DeadLetter);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn store_outage_is_reported_not_panicked() {
        let store = InMemoryOutboxStore::arc();
        store.set_available(false);
        let processor = OutboxProcessor::new(store, ScriptedPublisher::with_script([]), config());

        assert!(matches!(processor.process_batch().await, Err(OutboxError::Persistence(_))));
    }

    #[tokio::test]
    async fn run_loop_drains_and_stops_on_shutdown() {
        let store = InMemoryOutboxStore::arc();
        let event = seed(&store, NewOutboxEvent::new("a", "order.created", json!({}), "k")).await;
        let processor = Arc::new(OutboxProcessor::new(
            store.clone(),
            ScriptedPublisher::with_script([]),
            config().with_poll_interval(Duration::from_millis(10)),
        ));

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn({
            let processor = Arc::clone(&processor);
            async move { processor.run(rx).await }
        });

        for _ in 0..100 {
            if store.get(event.id).await.unwrap().unwrap().status == OutboxStatus::Processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(store.get(event.id).await.unwrap().unwrap().status, OutboxStatus::Processed);
    }
}
