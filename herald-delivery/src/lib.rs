//! Resilient delivery of messages to an unreliable external channel
//!
//! This crate provides:
//! - A circuit breaker guarding the channel
//! - A priority queue of ready messages
//! - A processor that drains the queue, retries failures with exponential
//!   backoff and gives up after a bounded number of attempts

mod channel;
pub mod circuit_breaker;
mod error;
mod events;
pub mod policy;
mod processor;
pub mod queue;
mod service;
mod types;

// Re-export the channel seam
pub use channel::{ChannelError, ExternalChannel, Receipt};
// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, SUCCESSES_TO_CLOSE,
};
// Re-export error types
pub use error::{DeliveryError, SystemError};
pub use events::DeliveryEvent;
pub use policy::RetryPolicy;
// Re-export core types
pub use processor::{DeliveryConfig, DeliveryProcessor};
pub use queue::PriorityQueue;
pub use service::DeliveryQueryService;
pub use types::{Message, MessageId, Priority, QueueStatus, SubmitStatus, Submission};
