//! Type definitions for the delivery queue and processor

use std::{fmt, str::FromStr, sync::Arc, time::SystemTime};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{circuit_breaker::CircuitState, error::DeliveryError};

/// Unique, immutable identifier assigned to a message at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Priority class of a message, fixed at submission
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Queue weight of this class, higher is dequeued first
    #[must_use]
    pub const fn weight(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        })
    }
}

impl FromStr for Priority {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(DeliveryError::InvalidPriority(s.to_string())),
        }
    }
}

/// A message tracked by the delivery processor
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    /// Destination address, opaque to the pipeline (Arc for cheap cloning)
    pub destination: Arc<str>,
    /// Message body, opaque to the pipeline (Arc for cheap cloning)
    pub payload: Arc<str>,
    pub priority: Priority,
    /// Delivery attempts made so far
    pub attempts: u32,
    /// Ceiling on attempts, copied from the retry policy at submission
    pub max_attempts: u32,
    pub created_at: SystemTime,
    /// Wall-clock time the next retry is due, `None` until one is scheduled
    ///
    /// Informational only. The retry scheduler keeps its own monotonic
    /// deadline, which is what actually releases the message.
    pub scheduled_at: Option<SystemTime>,
}

impl Message {
    #[must_use]
    pub fn new(
        destination: Arc<str>,
        payload: Arc<str>,
        priority: Priority,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            destination,
            payload,
            priority,
            attempts: 0,
            max_attempts,
            created_at: SystemTime::now(),
            scheduled_at: None,
        }
    }

    /// Whether another attempt is allowed after the ones already made
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Status label returned to a submitter
///
/// The message is queued identically either way, the label only reflects
/// whether the breaker was open at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    QueuedForProcessing,
    QueuedServiceUnavailable,
}

impl SubmitStatus {
    #[must_use]
    pub const fn for_breaker(state: CircuitState) -> Self {
        match state {
            CircuitState::Open => Self::QueuedServiceUnavailable,
            CircuitState::Closed | CircuitState::HalfOpen => Self::QueuedForProcessing,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueuedForProcessing => "queued_for_processing",
            Self::QueuedServiceUnavailable => "queued_service_unavailable",
        }
    }
}

impl fmt::Display for SubmitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub message_id: MessageId,
    pub status: SubmitStatus,
}

/// Snapshot of the ready queue and the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Messages ready for delivery, scheduled retries are not counted
    pub size: usize,
    pub breaker_state: CircuitState,
}
