//! `herald-core`: shared building blocks for the outbox and event bus.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod backoff;
pub mod error;
pub mod id;
pub mod priority;

pub use backoff::Backoff;
pub use error::{CoreError, CoreResult};
pub use id::EventId;
pub use priority::Priority;
