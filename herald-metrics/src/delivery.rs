//! Delivery pipeline metrics
//!
//! Tracks outbound delivery including:
//! - Delivery attempts by outcome
//! - Channel call latency
//! - Retries, permanent failures and circuit breaker rejections
//! - Current priority queue size

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Outcome of a single delivery attempt, used as the `outcome` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    ChannelFailure,
    CircuitOpen,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::ChannelFailure => "channel_failure",
            Self::CircuitOpen => "circuit_open",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Delivered => 0,
            Self::ChannelFailure => 1,
            Self::CircuitOpen => 2,
        }
    }
}

/// Delivery metrics collector
#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Total number of delivery attempts by outcome
    attempts_total: Counter<u64>,

    /// Distribution of external channel call durations
    channel_latency_seconds: Histogram<f64>,

    /// Total number of messages delivered successfully
    messages_delivered: Counter<u64>,

    /// Total number of messages permanently failed
    messages_failed: Counter<u64>,

    /// Total number of retries scheduled
    messages_retrying: Counter<u64>,

    /// Distribution of attempts needed before success
    attempts_before_success: Histogram<u64>,

    // Local counters, the queue gauge callback reads `queue_size`
    queue_size: Arc<AtomicU64>,
    delivered_count: AtomicU64,
    failed_count: AtomicU64,
    retry_count: AtomicU64,
    attempt_counts: [AtomicU64; 3],
}

impl DeliveryMetrics {
    /// Create a new delivery metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let attempts_total = meter
            .u64_counter("herald.delivery.attempts.total")
            .with_description("Total number of delivery attempts by outcome")
            .build();

        let channel_latency_seconds = meter
            .f64_histogram("herald.delivery.channel.latency.seconds")
            .with_description("Distribution of external channel call durations")
            .build();

        let messages_delivered = meter
            .u64_counter("herald.delivery.messages.delivered.total")
            .with_description("Total number of messages delivered successfully")
            .build();

        let messages_failed = meter
            .u64_counter("herald.delivery.messages.failed.total")
            .with_description("Total number of messages permanently failed")
            .build();

        let messages_retrying = meter
            .u64_counter("herald.delivery.messages.retrying.total")
            .with_description("Total number of retries scheduled")
            .build();

        let attempts_before_success = meter
            .u64_histogram("herald.delivery.attempts.before_success")
            .with_description("Distribution of attempts needed before a successful delivery")
            .build();

        let queue_size = Arc::new(AtomicU64::new(0));
        let observed = queue_size.clone();

        // The meter keeps this alive internally via the callback
        meter
            .u64_observable_gauge("herald.delivery.queue.size")
            .with_description("Current number of messages ready in the priority queue")
            .with_callback(move |observer| {
                observer.observe(observed.load(Ordering::Relaxed), &[]);
            })
            .build();

        Ok(Self {
            attempts_total,
            channel_latency_seconds,
            messages_delivered,
            messages_failed,
            messages_retrying,
            attempts_before_success,
            queue_size,
            delivered_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            attempt_counts: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        })
    }

    /// Record a delivery attempt
    pub fn record_attempt(&self, outcome: AttemptOutcome) {
        self.attempts_total
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
        self.attempt_counts[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a call into the external channel took
    pub fn record_channel_latency(&self, duration_secs: f64) {
        self.channel_latency_seconds.record(duration_secs, &[]);
    }

    /// Record a successful delivery
    ///
    /// The final attempt itself is recorded separately via [`Self::record_attempt`].
    pub fn record_delivery_success(&self, attempts: u32) {
        self.messages_delivered.add(1, &[]);
        self.attempts_before_success.record(u64::from(attempts), &[]);
        self.delivered_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message that exhausted its attempts
    ///
    /// `reason` becomes a metric attribute and must come from a fixed set.
    pub fn record_permanent_failure(&self, reason: &'static str) {
        self.messages_failed.add(1, &[KeyValue::new("reason", reason)]);
        self.failed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self) {
        self.messages_retrying.add(1, &[]);
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the current queue size
    pub fn set_queue_size(&self, size: u64) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    #[must_use]
    pub fn queue_size(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn permanently_failed(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn circuit_rejections(&self) -> u64 {
        self.attempts(AttemptOutcome::CircuitOpen)
    }

    /// Attempts recorded with `outcome`
    #[must_use]
    pub fn attempts(&self, outcome: AttemptOutcome) -> u64 {
        self.attempt_counts[outcome.index()].load(Ordering::Relaxed)
    }
}

/// Get the OpenTelemetry meter for delivery metrics
fn meter() -> Meter {
    opentelemetry::global::meter("herald.delivery")
}
