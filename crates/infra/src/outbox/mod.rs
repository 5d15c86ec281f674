//! Transactional outbox: rows written with business data, published later.

pub mod cleanup;
pub mod event;
pub mod in_memory;
pub mod postgres;
pub mod processor;
pub mod store;
pub mod transactional;

pub use cleanup::{CleanupReport, OutboxCleanup};
pub use event::{
    HEADER_AGGREGATE_ID, HEADER_PARTITION_KEY, NewOutboxEvent, OutboxEvent, OutboxStatus,
    PublishOutcome,
};
pub use in_memory::{InMemoryOutboxStore, InMemoryTx};
pub use postgres::PostgresOutboxStore;
pub use processor::{
    BatchReport, OutboxConfig, OutboxMetrics, OutboxMetricsSnapshot, OutboxProcessor,
};
pub use store::{OutboxError, OutboxStore, StatusCounts};
pub use transactional::{OutboxTransaction, TransactionalOutbox};
