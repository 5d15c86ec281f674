use async_trait::async_trait;

use crate::envelope::Envelope;

/// Failure reported by an [`EventHandler`].
///
/// Any failure makes the bus retry the message (with delay) until the
/// envelope's `max_retries` is reached, after which it is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler '{handler}' failed: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Consumer-side handler for one or more event types.
///
/// Delivery is at-least-once: the same envelope (same `event_id`) may arrive more
/// than once, so handlers must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Event types this handler wants to receive.
    fn event_types(&self) -> Vec<String>;

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}
