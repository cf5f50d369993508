//! Typed error handling for delivery operations.
//!
//! Failures on the delivery path fall into two groups:
//! - Retryable failures (circuit open, channel failure) - scheduled for retry
//! - Terminal failures (attempts exhausted) - the message is dropped
//!
//! Neither group ever reaches a submitter, submission always succeeds.

use thiserror::Error;

use crate::channel::ChannelError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Admission rejected by an open circuit breaker, the channel was not called.
    #[error("Circuit breaker is OPEN - service unavailable")]
    CircuitOpen,

    /// The external channel call itself failed.
    #[error("Channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// The message used up all of its delivery attempts.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    /// A priority label did not name a known priority class.
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    /// System-level error (configuration, wiring).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// System-level errors that indicate configuration or wiring problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A collaborator named in configuration does not exist.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Returns `true` if the failed attempt may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::Channel(_))
    }

    /// Returns `true` if the message has been abandoned.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AttemptsExhausted { .. })
    }
}
