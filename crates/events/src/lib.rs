//! Event transport mechanics: envelopes, the publish circuit breaker, the
//! broker abstraction and the event bus that drives consumers.

pub mod breaker;
pub mod broker;
pub mod bus;
pub mod envelope;
pub mod handler;
pub mod in_memory_broker;
pub mod routing;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitMetrics, CircuitOpenError,
    CircuitSnapshot, CircuitState, InvalidCircuitConfig, TransitionCounts,
};
pub use broker::{
    Broker, BrokerError, Consumer, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER, Delivery, QueueSpec,
    WireMessage,
};
pub use bus::{
    BusMetrics, BusMetricsSnapshot, DeliveryOutcome, EventBus, EventBusConfig, EventBusError,
    EventPublisher,
};
pub use envelope::{ENVELOPE_VERSION, Envelope, EnvelopeBuilder, EnvelopeError, EnvelopeMetadata};
pub use handler::{EventHandler, HandlerError};
pub use in_memory_broker::InMemoryBroker;
pub use routing::{ExchangeKind, topic_matches};
