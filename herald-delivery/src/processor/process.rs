//! Queue draining for delivery attempts

use std::sync::{Arc, atomic::Ordering};

use tracing::debug;

use crate::processor::{DeliveryProcessor, delivery::attempt_delivery};

/// Deliver queued messages one at a time until the queue is empty
///
/// Runs with the processor's `draining` flag held. The flag is released only
/// once the queue is seen empty, and re-taken if a submission slipped in
/// between the last dequeue and the release. Once the processor is stopping,
/// no further message is dequeued after the attempt in flight.
pub async fn drain_queue(processor: Arc<DeliveryProcessor>) {
    let pacing = processor.config.pacing();

    loop {
        while !processor.is_stopping()
            && let Some(message_id) = processor.dequeue()
        {
            attempt_delivery(&processor, message_id).await;

            if processor.is_stopping() {
                break;
            }
            tokio::time::sleep(pacing).await;
        }

        processor.draining.store(false, Ordering::Release);

        if processor.is_stopping()
            || processor.queue.lock().is_empty()
            || processor
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            break;
        }
    }

    debug!("Delivery queue drained");
}
