//! Delivery processor orchestration

pub mod delivery;
pub mod process;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use herald_common::{Signal, internal};
use herald_metrics::DeliveryMetrics;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    sync::{Notify, broadcast},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    channel::ExternalChannel,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState},
    error::{DeliveryError, SystemError},
    events::DeliveryEvent,
    policy::RetryPolicy,
    queue::{PriorityQueue, retry::RetryScheduler},
    types::{Message, MessageId, Priority, QueueStatus, SubmitStatus, Submission},
};

const fn default_pacing_ms() -> u64 {
    100
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

const fn default_event_capacity() -> usize {
    1024
}

/// Delivery processor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Pause after each delivery attempt before the next dequeue (in milliseconds)
    ///
    /// Default: 100 milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Upper bound on a single channel call (in milliseconds)
    ///
    /// An elapsed timeout counts as a channel failure.
    ///
    /// Default: None (no bound)
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,

    /// How long `serve` waits for an in-flight drain on shutdown (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Buffered events per subscriber before it starts lagging
    ///
    /// Default: 1024
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            pacing_ms: default_pacing_ms(),
            send_timeout_ms: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DeliveryConfig {
    /// Check the configuration for values the processor cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Configuration`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), SystemError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(SystemError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(SystemError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        self.retry.validate()
    }

    pub const fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Orchestrates delivery of submitted messages through the circuit breaker
///
/// Submissions are stored and queued by priority. A single-flight drain loop
/// takes ready messages off the queue one at a time and hands them to the
/// external channel. Failed attempts are parked in a retry scheduler until
/// their backoff elapses; [`serve`](Self::serve) moves them back into the
/// queue and restarts the drain when the breaker recovers.
pub struct DeliveryProcessor {
    pub(crate) config: DeliveryConfig,
    pub(crate) channel: Arc<dyn ExternalChannel>,
    pub(crate) breaker: CircuitBreaker,

    /// Every message that has not yet been delivered or abandoned
    pub(crate) store: DashMap<MessageId, Message>,
    pub(crate) queue: Mutex<PriorityQueue<MessageId>>,
    pub(crate) retries: Mutex<RetryScheduler<MessageId>>,
    pub(crate) retry_wakeup: Notify,

    /// Set while a drain loop is running
    pub(crate) draining: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<()>>>,

    /// Set once shutdown begins, no drain starts or dequeues after it
    stopping: AtomicBool,

    events: broadcast::Sender<DeliveryEvent>,
    pub(crate) metrics: Option<&'static DeliveryMetrics>,
}

impl fmt::Debug for DeliveryProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryProcessor")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("stored", &self.store.len())
            .field("queued", &self.queue.lock().len())
            .field("scheduled", &self.retries.lock().len())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeliveryProcessor {
    /// Create a processor delivering through `channel`
    ///
    /// Metrics are recorded if the global metrics instance has been initialised.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    pub fn new(
        config: DeliveryConfig,
        channel: Arc<dyn ExternalChannel>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());

        internal!(
            level = DEBUG,
            "Delivery processor configured: failure_threshold={}, reset_timeout={}ms, max_attempts={}, pacing={}ms",
            config.circuit_breaker.failure_threshold,
            config.circuit_breaker.reset_timeout_ms,
            config.retry.max_attempts(),
            config.pacing_ms
        );

        Ok(Self {
            config,
            channel,
            breaker,
            store: DashMap::new(),
            queue: Mutex::new(PriorityQueue::new()),
            retries: Mutex::new(RetryScheduler::new()),
            retry_wakeup: Notify::new(),
            draining: AtomicBool::new(false),
            drain_task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            events,
            metrics: herald_metrics::metrics().map(|metrics| &metrics.delivery),
        })
    }

    /// Record into `metrics` instead of the global instance
    #[must_use]
    pub const fn with_metrics(mut self, metrics: &'static DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept a message for delivery
    ///
    /// Submission always succeeds; delivery outcomes are reported through
    /// [`subscribe`](Self::subscribe). The returned status only labels whether
    /// the breaker was open at the time.
    pub fn submit(
        self: &Arc<Self>,
        destination: impl Into<Arc<str>>,
        payload: impl Into<Arc<str>>,
        priority: Priority,
    ) -> Submission {
        let message = Message::new(
            destination.into(),
            payload.into(),
            priority,
            self.config.retry.max_attempts(),
        );
        let message_id = message.id;

        self.store.insert(message_id, message);
        let queue_size = self.enqueue(message_id, priority);
        let breaker_state = self.breaker.state();

        tracing::info!(
            message_id = %message_id,
            priority = %priority,
            queue_size,
            "Message queued"
        );

        self.emit(DeliveryEvent::Queued {
            message_id,
            queue_size,
            breaker_state,
        });

        self.drain();

        Submission {
            message_id,
            status: SubmitStatus::for_breaker(breaker_state),
        }
    }

    /// Start the drain loop unless one is already running or shutdown has begun
    pub fn drain(self: &Arc<Self>) {
        if self.is_stopping() {
            return;
        }

        let mut task = self.drain_task.lock();
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *task = Some(tokio::spawn(process::drain_queue(Arc::clone(self))));
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Receive every lifecycle event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            size: self.queue.lock().len(),
            breaker_state: self.breaker.state(),
        }
    }

    /// Every message not yet delivered or abandoned, oldest first
    pub fn pending_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .store
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }

    pub fn get(&self, message_id: &MessageId) -> Option<Message> {
        self.store.get(message_id).map(|entry| entry.value().clone())
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Run the retry scheduler and breaker recovery until shutdown
    ///
    /// Due retries are moved back into the queue as their backoff elapses, and
    /// the drain loop is restarted whenever the breaker enters Closed or
    /// Half-Open.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop releasing scheduled retries and dequeueing new messages
    /// 2. Wait for the delivery in flight to complete (bounded by `shutdown_timeout_secs`)
    /// 3. Abort the drain loop if the timeout elapsed
    /// 4. Exit, dropping whatever is still queued or scheduled
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery processor encounters a fatal error
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let mut breaker_changes = self.breaker.subscribe();

        // Anything submitted before serve started
        self.drain();

        loop {
            let next_due = self.retries.lock().next_due();

            tokio::select! {
                () = sleep_until_due(next_due) => {
                    self.release_due_retries();
                }
                () = self.retry_wakeup.notified() => {
                    // New retry scheduled, recompute the earliest deadline
                }
                change = breaker_changes.recv() => {
                    match change {
                        Ok(state) => self.on_breaker_change(state),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Missed circuit breaker transitions");
                            self.drain();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::error!("Circuit breaker notification channel closed");
                            break;
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Delivery processor received shutdown signal");
                            self.wait_for_drain().await;
                            internal!("Delivery processor shutdown complete");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Delivery processor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn on_breaker_change(self: &Arc<Self>, state: CircuitState) {
        internal!(level = INFO, "Circuit breaker state changed to {state}");
        self.emit(DeliveryEvent::BreakerStateChanged { state });

        if matches!(state, CircuitState::Closed | CircuitState::HalfOpen) {
            self.drain();
        }
    }

    /// Move every retry whose backoff has elapsed back into the queue
    fn release_due_retries(self: &Arc<Self>) {
        let due = self.retries.lock().pop_due(Instant::now());
        if due.is_empty() {
            return;
        }

        for message_id in due {
            let Some(priority) = self.store.get(&message_id).map(|entry| entry.priority) else {
                continue;
            };

            tracing::debug!(message_id = %message_id, "Retry due, re-queueing");
            self.enqueue(message_id, priority);
        }

        self.drain();
    }

    async fn wait_for_drain(&self) {
        self.stopping.store(true, Ordering::Release);

        let shutdown_timeout = self.config.shutdown_timeout();
        let start = Instant::now();

        while self.draining.load(Ordering::Acquire) {
            if start.elapsed() >= shutdown_timeout {
                tracing::warn!(
                    "Shutdown timeout exceeded after {:.1}s with a delivery still in flight, aborting it",
                    start.elapsed().as_secs_f64()
                );
                if let Some(task) = self.drain_task.lock().take() {
                    task.abort();
                }
                break;
            }

            tracing::debug!(
                "Waiting for in-flight delivery to complete ({:.1}s elapsed)...",
                start.elapsed().as_secs_f64()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.store.len();
        if remaining == 0 {
            internal!("All deliveries completed");
        } else {
            tracing::warn!(
                remaining,
                queued = self.queue.lock().len(),
                scheduled = self.retries.lock().len(),
                "Shutting down with undelivered messages, they will be dropped"
            );
        }
    }

    /// Queue a message at its priority weight, returning the new queue size
    pub(crate) fn enqueue(&self, message_id: MessageId, priority: Priority) -> usize {
        let size = {
            let mut queue = self.queue.lock();
            queue.enqueue(message_id, priority.weight());
            queue.len()
        };
        self.record_queue_size(size);
        size
    }

    pub(crate) fn dequeue(&self) -> Option<MessageId> {
        let (next, size) = {
            let mut queue = self.queue.lock();
            (queue.dequeue(), queue.len())
        };
        self.record_queue_size(size);
        next
    }

    pub(crate) fn emit(&self, event: DeliveryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn record_queue_size(&self, size: usize) {
        if let Some(metrics) = self.metrics {
            metrics.set_queue_size(size as u64);
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
