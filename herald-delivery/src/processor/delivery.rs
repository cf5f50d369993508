//! A single delivery attempt and its outcome handling

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use herald_common::outgoing;
use herald_metrics::AttemptOutcome;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelError, Receipt},
    error::DeliveryError,
    events::DeliveryEvent,
    processor::DeliveryProcessor,
    types::{Message, MessageId},
};

/// Attempt delivery of one dequeued message through the circuit breaker
///
/// The message stays in the store for the duration of the attempt. On success
/// or terminal failure it is removed; otherwise it is parked in the retry
/// scheduler until its backoff elapses.
pub async fn attempt_delivery(processor: &Arc<DeliveryProcessor>, message_id: MessageId) {
    let Some(message) = processor.get(&message_id) else {
        warn!(message_id = %message_id, "Dequeued message no longer tracked, skipping");
        return;
    };

    debug!(
        message_id = %message_id,
        attempt = message.attempts + 1,
        max_attempts = message.max_attempts,
        "Attempting delivery"
    );

    let started = Instant::now();
    let result = send_through_breaker(processor, &message).await;

    if !matches!(result, Err(DeliveryError::CircuitOpen))
        && let Some(metrics) = processor.metrics
    {
        metrics.record_channel_latency(started.elapsed().as_secs_f64());
    }

    match result {
        Ok(receipt) => handle_success(processor, &message, receipt),
        Err(error) => handle_failure(processor, message_id, &error),
    }
}

async fn send_through_breaker(
    processor: &DeliveryProcessor,
    message: &Message,
) -> Result<Receipt, DeliveryError> {
    let channel = Arc::clone(&processor.channel);
    let destination = Arc::clone(&message.destination);
    let payload = Arc::clone(&message.payload);
    let send_timeout = processor.config.send_timeout();

    processor
        .breaker
        .execute(move || async move {
            outgoing!("Sending message to {destination}");
            let send = channel.send(&destination, &payload);

            match send_timeout {
                Some(limit) => tokio::time::timeout(limit, send)
                    .await
                    .unwrap_or_else(|_| Err(ChannelError::new("timed out"))),
                None => send.await,
            }
        })
        .await
}

fn handle_success(processor: &DeliveryProcessor, message: &Message, receipt: Receipt) {
    let attempts = message.attempts + 1;
    processor.store.remove(&message.id);

    info!(
        message_id = %message.id,
        attempts,
        receipt = %receipt.id,
        "Message delivered"
    );

    processor.emit(DeliveryEvent::Delivered {
        message_id: message.id,
        attempts,
        receipt: receipt.id,
    });

    if let Some(metrics) = processor.metrics {
        metrics.record_attempt(AttemptOutcome::Delivered);
        metrics.record_delivery_success(attempts);
    }
}

fn handle_failure(processor: &DeliveryProcessor, message_id: MessageId, error: &DeliveryError) {
    // The guard must be released before the store is touched again
    let Some(message) = processor.store.get_mut(&message_id).map(|mut entry| {
        entry.attempts += 1;
        entry.value().clone()
    }) else {
        return;
    };

    let reason = error.to_string();

    warn!(
        message_id = %message_id,
        attempt = message.attempts,
        max_attempts = message.max_attempts,
        error = %reason,
        "Delivery attempt failed"
    );

    processor.emit(DeliveryEvent::DeliveryFailed {
        message_id,
        error: reason.clone(),
        attempt: message.attempts,
        max_attempts: message.max_attempts,
    });

    let outcome = match error {
        DeliveryError::CircuitOpen => AttemptOutcome::CircuitOpen,
        _ => AttemptOutcome::ChannelFailure,
    };

    if let Some(metrics) = processor.metrics {
        metrics.record_attempt(outcome);
    }

    if message.has_attempts_left() {
        let delay = processor.config.retry.delay_for(message.attempts);
        schedule_retry(processor, &message, delay);
    } else {
        abandon(processor, &message, outcome, reason);
    }
}

fn schedule_retry(processor: &DeliveryProcessor, message: &Message, delay: Duration) {
    // Wall-clock label only, the scheduler runs off the tokio clock
    let scheduled_at = SystemTime::now() + delay;

    if let Some(mut entry) = processor.store.get_mut(&message.id) {
        entry.scheduled_at = Some(scheduled_at);
    }

    processor
        .retries
        .lock()
        .schedule(message.id, Instant::now() + delay);
    processor.retry_wakeup.notify_one();

    info!(
        message_id = %message.id,
        attempt = message.attempts,
        delay = ?delay,
        "Retry scheduled"
    );

    processor.emit(DeliveryEvent::RetryScheduled {
        message_id: message.id,
        attempt: message.attempts,
        delay,
        scheduled_at,
    });

    if let Some(metrics) = processor.metrics {
        metrics.record_retry();
    }
}

fn abandon(
    processor: &DeliveryProcessor,
    message: &Message,
    last_outcome: AttemptOutcome,
    last_error: String,
) {
    processor.store.remove(&message.id);

    let terminal = DeliveryError::AttemptsExhausted {
        attempts: message.attempts,
        last_error,
    };

    error!(
        message_id = %message.id,
        attempts = message.attempts,
        error = %terminal,
        "Message permanently failed"
    );

    if let Some(metrics) = processor.metrics {
        metrics.record_permanent_failure(last_outcome.as_str());
    }

    processor.emit(DeliveryEvent::PermanentlyFailed {
        message_id: message.id,
        error: terminal.to_string(),
    });
}
