//! Lifecycle notifications published by the processor

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::{circuit_breaker::CircuitState, types::MessageId};

/// One step in a message's life, or a breaker transition
///
/// Every event is emitted by the [`DeliveryProcessor`](crate::DeliveryProcessor)
/// and fanned out to all subscribers. Slow subscribers may observe
/// [`tokio::sync::broadcast::error::RecvError::Lagged`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Queued {
        message_id: MessageId,
        queue_size: usize,
        breaker_state: CircuitState,
    },
    Delivered {
        message_id: MessageId,
        attempts: u32,
        /// Channel-assigned receipt id
        receipt: String,
    },
    DeliveryFailed {
        message_id: MessageId,
        error: String,
        attempt: u32,
        max_attempts: u32,
    },
    RetryScheduled {
        message_id: MessageId,
        attempt: u32,
        /// Backoff the retry is actually held for
        delay: Duration,
        /// Wall-clock estimate of when `delay` elapses
        scheduled_at: SystemTime,
    },
    PermanentlyFailed {
        message_id: MessageId,
        error: String,
    },
    BreakerStateChanged {
        state: CircuitState,
    },
}

impl DeliveryEvent {
    /// Message the event refers to, `None` for breaker transitions
    pub const fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Queued { message_id, .. }
            | Self::Delivered { message_id, .. }
            | Self::DeliveryFailed { message_id, .. }
            | Self::RetryScheduled { message_id, .. }
            | Self::PermanentlyFailed { message_id, .. } => Some(*message_id),
            Self::BreakerStateChanged { .. } => None,
        }
    }

    /// Short name, as used in logs
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Delivered { .. } => "delivered",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::PermanentlyFailed { .. } => "permanently_failed",
            Self::BreakerStateChanged { .. } => "breaker_state_changed",
        }
    }
}
