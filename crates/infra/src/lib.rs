//! Infrastructure layer: outbox storage and processing, broker adapters,
//! configuration and runtime wiring.

pub mod config;
pub mod outbox;
pub mod runtime;

/// Redis Streams broker adapter.
#[cfg(feature = "redis")]
pub mod redis_broker;


pub use config::{ConfigError, Settings};
pub use runtime::{OutboxRuntime, WorkerHandle};
