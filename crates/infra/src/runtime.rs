//! Wiring: one store, one bus, and the background loops that connect them.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use herald_events::{Broker, EventBus, InMemoryBroker};

use crate::config::Settings;
use crate::outbox::{
    OutboxCleanup, OutboxConfig, OutboxMetrics, OutboxProcessor, OutboxStore,
    PostgresOutboxStore, TransactionalOutbox,
};

/// Handle to control and join the background loops.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for every loop to stop.
    ///
    /// A batch or cleanup pass already running is finished first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for join in self.join {
            if let Err(err) = join.await {
                error!(error = %err, "outbox worker ended abnormally");
            }
        }
    }
}

/// The outbox pipeline for one service: producers write through
/// [`OutboxRuntime::outbox`], the processor publishes through the bus.
pub struct OutboxRuntime<S: OutboxStore, B: Broker> {
    outbox: TransactionalOutbox<S>,
    bus: Arc<EventBus<B>>,
    processor: Arc<OutboxProcessor<S, EventBus<B>>>,
    cleanup: Arc<OutboxCleanup<S>>,
    metrics: Arc<OutboxMetrics>,
}

impl<S: OutboxStore, B: Broker> std::fmt::Debug for OutboxRuntime<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRuntime")
            .field("config", self.processor.config())
            .finish_non_exhaustive()
    }
}

impl<S: OutboxStore, B: Broker> OutboxRuntime<S, B> {
    pub fn new(store: Arc<S>, bus: Arc<EventBus<B>>, config: OutboxConfig) -> Self {
        let metrics = Arc::new(OutboxMetrics::default());
        let outbox = TransactionalOutbox::new(Arc::clone(&store), &config);
        let cleanup = Arc::new(OutboxCleanup::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&metrics),
        ));
        let processor = Arc::new(OutboxProcessor::with_metrics(
            store,
            Arc::clone(&bus),
            config,
            Arc::clone(&metrics),
        ));
        Self {
            outbox,
            bus,
            processor,
            cleanup,
            metrics,
        }
    }

    pub fn outbox(&self) -> &TransactionalOutbox<S> {
        &self.outbox
    }

    pub fn bus(&self) -> &Arc<EventBus<B>> {
        &self.bus
    }

    pub fn processor(&self) -> &Arc<OutboxProcessor<S, EventBus<B>>> {
        &self.processor
    }

    pub fn cleanup(&self) -> &Arc<OutboxCleanup<S>> {
        &self.cleanup
    }

    pub fn metrics(&self) -> &Arc<OutboxMetrics> {
        &self.metrics
    }

    /// Declare the bus topology and spawn the processor and cleanup loops.
    pub async fn start(&self) -> anyhow::Result<WorkerHandle> {
        self.bus.setup().await.context("event bus setup failed")?;

        let (shutdown, rx) = watch::channel(false);
        let processor = Arc::clone(&self.processor);
        let processor_rx = rx.clone();
        let cleanup = Arc::clone(&self.cleanup);
        let join = vec![
            tokio::spawn(async move { processor.run(processor_rx).await }),
            tokio::spawn(async move { cleanup.run(rx).await }),
        ];
        info!(
            source_service = %self.processor.config().source_service,
            "outbox runtime started"
        );
        Ok(WorkerHandle { shutdown, join })
    }

    /// Stop the outbox loops, then the bus consumers, then close the broker.
    pub async fn shutdown(&self, workers: WorkerHandle) -> anyhow::Result<()> {
        workers.shutdown().await;
        self.bus
            .shutdown()
            .await
            .context("event bus shutdown failed")?;
        info!("outbox runtime stopped");
        Ok(())
    }
}

/// Connect to Postgres and apply the outbox migration.
pub async fn connect_store(settings: &Settings) -> anyhow::Result<Arc<PostgresOutboxStore>> {
    let store = PostgresOutboxStore::connect(&settings.database_url, settings.db_max_connections)
        .await
        .context("connecting to the outbox database")?;
    store
        .migrate()
        .await
        .context("applying outbox migrations")?;
    Ok(Arc::new(store))
}

/// Postgres-backed runtime over an in-process broker, for single-process
/// deployments and local development.
pub async fn in_process_runtime(
    settings: &Settings,
) -> anyhow::Result<OutboxRuntime<PostgresOutboxStore, InMemoryBroker>> {
    let store = connect_store(settings).await?;
    let bus = Arc::new(EventBus::new(
        Arc::new(InMemoryBroker::new()),
        settings.event_bus_config(),
    ));
    Ok(OutboxRuntime::new(store, bus, settings.outbox_config()))
}

/// Postgres-backed runtime over Redis Streams; requires `HERALD_REDIS_URL`.
#[cfg(feature = "redis")]
pub async fn redis_runtime(
    settings: &Settings,
) -> anyhow::Result<OutboxRuntime<PostgresOutboxStore, crate::redis_broker::RedisStreamsBroker>> {
    use crate::redis_broker::{RedisBrokerConfig, RedisStreamsBroker};

    let redis_url = settings
        .redis_url
        .as_deref()
        .context("HERALD_REDIS_URL is required for the Redis broker")?;
    let store = connect_store(settings).await?;
    let broker = RedisStreamsBroker::connect(redis_url, RedisBrokerConfig::default())
        .await
        .context("connecting to Redis")?;
    let bus = Arc::new(EventBus::new(Arc::new(broker), settings.event_bus_config()));
    Ok(OutboxRuntime::new(store, bus, settings.outbox_config()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStatus};
    use herald_events::EventBusConfig;
    use serde_json::json;
    use std::time::Duration;

    fn runtime() -> OutboxRuntime<InMemoryOutboxStore, InMemoryBroker> {
        let bus = Arc::new(EventBus::new(
            Arc::new(InMemoryBroker::new()),
            EventBusConfig::default(),
        ));
        OutboxRuntime::new(
            InMemoryOutboxStore::arc(),
            bus,
            OutboxConfig::default()
                .with_source_service("orders")
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn started_runtime_publishes_committed_events() {
        let runtime = runtime();
        let workers = runtime.start().await.unwrap();

        let mut tx = runtime.outbox().begin().await.unwrap();
        let id = tx
            .create_event(NewOutboxEvent::new(
                "order-1",
                "order.created",
                json!({"total": 42}),
                "orders.created",
            ))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let store = runtime.outbox().store();
        let mut status = OutboxStatus::Pending;
        for _ in 0..100 {
            status = store.get(id).await.unwrap().unwrap().status;
            if status == OutboxStatus::Processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, OutboxStatus::Processed);
        assert!(runtime.metrics().snapshot().processed >= 1);

        runtime.shutdown(workers).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_the_bus() {
        let runtime = runtime();
        let workers = runtime.start().await.unwrap();
        runtime.shutdown(workers).await.unwrap();

        let envelope = herald_events::Envelope::builder("order.created", json!({}), "orders")
            .build()
            .unwrap();
        let result = runtime.bus().publish(&envelope, "orders.created", None).await;
        assert!(matches!(result, Err(herald_events::EventBusError::ShutDown)));
    }
}
