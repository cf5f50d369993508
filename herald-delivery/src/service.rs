//! Service trait abstraction for delivery status queries
//!
//! Status consumers (the demo ticker, a future control interface) depend on
//! this trait rather than on the concrete `DeliveryProcessor`.

use crate::{
    circuit_breaker::CircuitState,
    processor::DeliveryProcessor,
    types::{Message, MessageId, QueueStatus},
};

/// Read-only view of delivery state
///
/// # Example
///
/// ```rust,ignore
/// fn report(service: &dyn DeliveryQueryService) -> String {
///     format!("{} queued, breaker {}", service.queue_len(), service.breaker_state())
/// }
/// ```
pub trait DeliveryQueryService: Send + Sync {
    /// Number of messages ready for delivery, scheduled retries excluded
    fn queue_len(&self) -> usize;

    fn breaker_state(&self) -> CircuitState;

    /// Returns `None` once the message has been delivered or abandoned.
    fn get_message(&self, id: &MessageId) -> Option<Message>;

    /// Every message queued, scheduled for retry or in flight
    fn pending_messages(&self) -> Vec<Message>;

    fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            size: self.queue_len(),
            breaker_state: self.breaker_state(),
        }
    }
}

impl DeliveryQueryService for DeliveryProcessor {
    fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn breaker_state(&self) -> CircuitState {
        Self::breaker_state(self)
    }

    fn get_message(&self, id: &MessageId) -> Option<Message> {
        self.get(id)
    }

    fn pending_messages(&self) -> Vec<Message> {
        Self::pending_messages(self)
    }

    fn queue_status(&self) -> QueueStatus {
        Self::queue_status(self)
    }
}
