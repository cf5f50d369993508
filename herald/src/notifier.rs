//! Logs every delivery notification

use herald_delivery::DeliveryEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

/// Log events until the processor goes away
pub async fn log_events(mut events: broadcast::Receiver<DeliveryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notification logger fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::Queued {
            message_id,
            queue_size,
            breaker_state,
        } => info!("Message queued: {message_id} (Queue size: {queue_size}, Circuit: {breaker_state})"),
        DeliveryEvent::Delivered {
            message_id,
            attempts,
            receipt,
        } => info!("Message delivered: {message_id} (Attempts: {attempts}, Receipt: {receipt})"),
        DeliveryEvent::DeliveryFailed {
            message_id,
            error,
            attempt,
            max_attempts,
        } => warn!("Delivery failed: {message_id} (Attempt {attempt}/{max_attempts}) - {error}"),
        DeliveryEvent::RetryScheduled {
            message_id,
            attempt,
            delay,
            ..
        } => info!(
            "Retry scheduled: {message_id} (Attempt {attempt}, Delay: {}ms)",
            delay.as_millis()
        ),
        DeliveryEvent::PermanentlyFailed { message_id, error } => {
            error!("Message permanently failed: {message_id} - {error}");
        }
        DeliveryEvent::BreakerStateChanged { state } => info!("Circuit breaker: {state}"),
    }
}
