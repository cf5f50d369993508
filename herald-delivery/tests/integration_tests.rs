//! Integration tests for the delivery processor
//!
//! All tests run on tokio's paused clock, so backoff delays and breaker
//! timeouts elapse instantly while keeping their relative order.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{collections::HashMap, sync::Arc, time::Duration};

use herald_common::Signal;
use herald_delivery::{
    CircuitBreakerConfig, CircuitState, DeliveryConfig, DeliveryEvent, DeliveryProcessor,
    DeliveryQueryService, MessageId, Priority, RetryPolicy, SubmitStatus,
};
use herald_metrics::{AttemptOutcome, DeliveryMetrics};
use support::mock_channel::{FAILURE_REASON, MockChannel};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
};

fn config(
    failure_threshold: u32,
    reset_timeout_ms: u64,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> DeliveryConfig {
    DeliveryConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            ..CircuitBreakerConfig::default()
        },
        retry: RetryPolicy {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        },
        ..DeliveryConfig::default()
    }
}

struct Harness {
    processor: Arc<DeliveryProcessor>,
    events: broadcast::Receiver<DeliveryEvent>,
    shutdown: broadcast::Sender<Signal>,
    server: JoinHandle<Result<(), herald_delivery::DeliveryError>>,
}

impl Harness {
    fn start(config: DeliveryConfig, channel: Arc<MockChannel>) -> Self {
        Self::serving(DeliveryProcessor::new(config, channel).expect("valid configuration"))
    }

    fn serving(processor: DeliveryProcessor) -> Self {
        let processor = Arc::new(processor);
        let events = processor.subscribe();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(Arc::clone(&processor).serve(shutdown_rx));

        Self {
            processor,
            events,
            shutdown,
            server,
        }
    }

    async fn next_event(&mut self) -> DeliveryEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("event within ten virtual minutes")
            .expect("event channel open")
    }

    /// Collect events until `count` of them satisfy `finished`
    async fn collect_until(
        &mut self,
        count: usize,
        finished: impl Fn(&DeliveryEvent) -> bool,
    ) -> Vec<DeliveryEvent> {
        let mut seen = Vec::new();
        let mut matched = 0;

        while matched < count {
            let event = self.next_event().await;
            if finished(&event) {
                matched += 1;
            }
            seen.push(event);
        }

        seen
    }

    async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).expect("server listening");
        let result = self.server.await.expect("serve task completes");
        assert!(result.is_ok());
    }
}

fn is_delivered(event: &DeliveryEvent) -> bool {
    matches!(event, DeliveryEvent::Delivered { .. })
}

fn is_permanently_failed(event: &DeliveryEvent) -> bool {
    matches!(event, DeliveryEvent::PermanentlyFailed { .. })
}

fn retry_delays(events: &[DeliveryEvent]) -> Vec<Duration> {
    events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::RetryScheduled { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_priority_ordering() {
    let channel = MockChannel::succeeding();
    let mut harness = Harness::start(DeliveryConfig::default(), Arc::clone(&channel));

    let processor = &harness.processor;
    processor.submit("+15550000001", "L1", Priority::Low);
    processor.submit("+15550000002", "N1", Priority::Normal);
    processor.submit("+15550000003", "H1", Priority::High);
    processor.submit("+15550000004", "N2", Priority::Normal);
    processor.submit("+15550000005", "H2", Priority::High);

    // Nothing has run yet, everything is still queued
    assert_eq!(processor.queue_status().size, 5);

    let events = harness.collect_until(5, is_delivered).await;

    let queue_sizes: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::Queued { queue_size, .. } => Some(*queue_size),
            _ => None,
        })
        .collect();
    assert_eq!(queue_sizes, vec![1, 2, 3, 4, 5]);

    assert_eq!(channel.calls(), vec!["H1", "H2", "N1", "N2", "L1"]);
    assert!(harness.processor.pending_messages().is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_bounded_retries_with_exponential_backoff() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(100, 60_000, 3, 1_000, 10_000), Arc::clone(&channel));

    let submission = harness
        .processor
        .submit("+15550000001", "hello", Priority::Normal);
    assert_eq!(submission.status, SubmitStatus::QueuedForProcessing);

    let events = harness.collect_until(1, is_permanently_failed).await;

    assert_eq!(
        retry_delays(&events),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );

    let failed_attempts: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::DeliveryFailed {
                attempt,
                max_attempts,
                error,
                ..
            } => {
                assert_eq!(error, &format!("Channel failure: {FAILURE_REASON}"));
                Some((*attempt, *max_attempts))
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed_attempts, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);

    let permanent: Vec<&DeliveryEvent> = events.iter().filter(|e| is_permanently_failed(e)).collect();
    assert_eq!(permanent.len(), 1);
    assert!(matches!(
        permanent[0],
        DeliveryEvent::PermanentlyFailed { message_id, error }
            if *message_id == submission.message_id
                && error.starts_with("Max retries exceeded after 4 attempts")
    ));

    assert_eq!(channel.call_count(), 4);
    assert!(harness.processor.get(&submission.message_id).is_none());
    assert!(harness.processor.pending_messages().is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_capped_at_max_delay() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(100, 60_000, 3, 1_000, 3_000), channel);

    harness
        .processor
        .submit("+15550000001", "hello", Priority::High);

    let events = harness.collect_until(1, is_permanently_failed).await;

    assert_eq!(
        retry_delays(&events),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(3)
        ]
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_retry_is_visible_while_waiting() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(100, 60_000, 3, 1_000, 10_000), channel);

    let submission = harness
        .processor
        .submit("+15550000001", "hello", Priority::Low);

    harness
        .collect_until(1, |event| {
            matches!(event, DeliveryEvent::RetryScheduled { .. })
        })
        .await;

    let service: &dyn DeliveryQueryService = &*harness.processor;
    let message = service
        .get_message(&submission.message_id)
        .expect("message still tracked");
    assert_eq!(message.attempts, 1);
    assert!(message.scheduled_at.is_some());

    // Scheduled retries are not part of the ready queue
    assert_eq!(service.queue_len(), 0);
    assert_eq!(service.pending_messages().len(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_duplicate_delivery() {
    let channel = MockChannel::failing_first(4);
    let mut harness = Harness::start(config(100, 60_000, 5, 100, 1_000), Arc::clone(&channel));

    let mut submitted = Vec::new();
    for n in 0..5 {
        let submission = harness
            .processor
            .submit("+15550000000", format!("first-{n}"), Priority::Normal);
        submitted.push(submission.message_id);
    }

    // Let the drain get going, then submit while it is active
    tokio::time::sleep(Duration::from_millis(150)).await;
    for n in 0..5 {
        let priority = if n % 2 == 0 { Priority::High } else { Priority::Low };
        let submission = harness
            .processor
            .submit("+15550000000", format!("second-{n}"), priority);
        submitted.push(submission.message_id);
    }

    let events = harness.collect_until(10, is_delivered).await;

    let mut deliveries: HashMap<MessageId, usize> = HashMap::new();
    for event in &events {
        if let DeliveryEvent::Delivered { message_id, .. } = event {
            *deliveries.entry(*message_id).or_default() += 1;
        }
    }

    assert_eq!(deliveries.len(), 10);
    assert!(deliveries.values().all(|count| *count == 1));
    assert!(submitted.iter().all(|id| deliveries.contains_key(id)));
    assert!(!events.iter().any(is_permanently_failed));

    // Four failures plus one successful call per message
    assert_eq!(channel.call_count(), 14);
    assert!(harness.processor.pending_messages().is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_breaker_protects_channel_during_outage() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(3, 5_000, 3, 1_000, 10_000), Arc::clone(&channel));

    harness.processor.submit("+15550000001", "H1", Priority::High);
    harness.processor.submit("+15550000002", "H2", Priority::High);
    harness.processor.submit("+15550000003", "N1", Priority::Normal);
    harness.processor.submit("+15550000004", "N2", Priority::Normal);
    harness.processor.submit("+15550000005", "L1", Priority::Low);

    let events = harness.collect_until(5, is_permanently_failed).await;

    let states: Vec<CircuitState> = events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::BreakerStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&CircuitState::Open));
    assert!(states.contains(&CircuitState::HalfOpen));
    assert!(!states.contains(&CircuitState::Closed));

    // Fail fast while open
    assert!(events.iter().any(|event| matches!(
        event,
        DeliveryEvent::DeliveryFailed { error, .. }
            if error == "Circuit breaker is OPEN - service unavailable"
    )));

    // Three trips' worth of calls plus a handful of half-open probes
    assert!(channel.call_count() >= 3);
    assert!(channel.call_count() < 20);

    for event in events.iter().filter(|e| is_permanently_failed(e)) {
        assert!(matches!(
            event,
            DeliveryEvent::PermanentlyFailed { error, .. }
                if error.starts_with("Max retries exceeded after 4 attempts")
        ));
    }

    assert!(harness.processor.pending_messages().is_empty());
    assert_eq!(harness.processor.breaker_state(), CircuitState::Open);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_after_outage() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(2, 1_000, 6, 100, 10_000), Arc::clone(&channel));

    harness.processor.submit("+15550000001", "m1", Priority::Normal);
    harness.processor.submit("+15550000002", "m2", Priority::Normal);

    harness
        .collect_until(1, |event| {
            matches!(
                event,
                DeliveryEvent::BreakerStateChanged {
                    state: CircuitState::Open
                }
            )
        })
        .await;

    for n in 3..=5 {
        let submission =
            harness
                .processor
                .submit("+15550000000", format!("m{n}"), Priority::High);
        assert_eq!(submission.status, SubmitStatus::QueuedServiceUnavailable);
    }

    channel.set_failing(false);

    let events = harness.collect_until(5, is_delivered).await;

    let states: Vec<CircuitState> = events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::BreakerStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    let half_open = states
        .iter()
        .position(|state| *state == CircuitState::HalfOpen)
        .expect("breaker probed recovery");
    assert!(states[half_open..].contains(&CircuitState::Closed));

    assert!(!events.iter().any(is_permanently_failed));
    assert!(harness.processor.pending_messages().is_empty());
    assert_eq!(harness.processor.breaker_state(), CircuitState::Closed);

    let stats = harness.processor.breaker_stats();
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_counts_as_failure() {
    let channel = MockChannel::with_latency(Duration::from_secs(5));
    let mut config = config(5, 60_000, 0, 1_000, 10_000);
    config.send_timeout_ms = Some(1_000);

    let mut harness = Harness::start(config, Arc::clone(&channel));
    let submission = harness
        .processor
        .submit("+15550000001", "slow", Priority::Normal);

    let events = harness.collect_until(1, is_permanently_failed).await;

    assert!(events.iter().any(|event| matches!(
        event,
        DeliveryEvent::DeliveryFailed { message_id, error, attempt: 1, max_attempts: 1 }
            if *message_id == submission.message_id && error == "Channel failure: timed out"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        DeliveryEvent::PermanentlyFailed { error, .. }
            if error == "Max retries exceeded after 1 attempts: Channel failure: timed out"
    )));
    assert_eq!(harness.processor.breaker_stats().failure_count, 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_waits_for_in_flight_delivery() {
    let channel = MockChannel::with_latency(Duration::from_secs(2));
    let mut harness = Harness::start(DeliveryConfig::default(), Arc::clone(&channel));

    harness
        .processor
        .submit("+15550000001", "in-flight", Priority::Normal);

    // Let the drain pick the message up
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.processor.queue_status().size, 0);

    harness
        .shutdown
        .send(Signal::Shutdown)
        .expect("server listening");
    let result = (&mut harness.server).await.expect("serve task completes");
    assert!(result.is_ok());

    let delivered = harness.next_event().await;
    let delivered = if matches!(delivered, DeliveryEvent::Queued { .. }) {
        harness.next_event().await
    } else {
        delivered
    };
    assert!(is_delivered(&delivered));
    assert_eq!(channel.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_scheduled_retries() {
    let channel = MockChannel::failing();
    let mut harness = Harness::start(config(100, 60_000, 3, 1_000, 10_000), channel);

    harness
        .processor
        .submit("+15550000001", "doomed", Priority::Normal);

    harness
        .collect_until(1, |event| {
            matches!(event, DeliveryEvent::RetryScheduled { .. })
        })
        .await;

    let processor = Arc::clone(&harness.processor);
    harness.stop().await;

    // Still tracked, never retried after shutdown
    assert_eq!(processor.pending_messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_between_attempts() {
    let channel = MockChannel::succeeding();
    let config = DeliveryConfig {
        pacing_ms: 100,
        ..DeliveryConfig::default()
    };
    let mut harness = Harness::start(config, Arc::clone(&channel));

    for n in 0..3 {
        harness
            .processor
            .submit("+15550000000", format!("m{n}"), Priority::Normal);
    }
    harness.collect_until(3, is_delivered).await;

    let times = channel.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
    }

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_pacing_sends_back_to_back() {
    let channel = MockChannel::succeeding();
    let config = DeliveryConfig {
        pacing_ms: 0,
        ..DeliveryConfig::default()
    };
    let mut harness = Harness::start(config, Arc::clone(&channel));

    for n in 0..3 {
        harness
            .processor
            .submit("+15550000000", format!("m{n}"), Priority::Normal);
    }
    harness.collect_until(3, is_delivered).await;

    let times = channel.call_times();
    assert_eq!(times.len(), 3);
    assert!(times[2].duration_since(times[0]) < Duration::from_millis(100));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_released_after_reported_delay() {
    let channel = MockChannel::failing_first(1);
    let mut harness = Harness::start(config(100, 60_000, 3, 1_000, 10_000), Arc::clone(&channel));

    harness
        .processor
        .submit("+15550000001", "hello", Priority::Normal);

    let events = harness.collect_until(1, is_delivered).await;
    let delays = retry_delays(&events);
    assert_eq!(delays, vec![Duration::from_secs(2)]);

    let times = channel.call_times();
    assert_eq!(times.len(), 2);
    let gap = times[1].duration_since(times[0]);
    assert!(gap >= delays[0]);
    assert!(gap < delays[0] + Duration::from_millis(100));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_metrics_count_each_attempt_once() {
    let metrics: &'static DeliveryMetrics = Box::leak(Box::new(
        DeliveryMetrics::new().expect("Failed to create delivery metrics"),
    ));
    let channel = MockChannel::failing_first(1);
    let processor = DeliveryProcessor::new(config(100, 60_000, 3, 100, 1_000), channel)
        .expect("valid configuration")
        .with_metrics(metrics);
    let mut harness = Harness::serving(processor);

    harness
        .processor
        .submit("+15550000001", "hello", Priority::High);
    harness.collect_until(1, is_delivered).await;

    assert_eq!(metrics.attempts(AttemptOutcome::Delivered), 1);
    assert_eq!(metrics.attempts(AttemptOutcome::ChannelFailure), 1);
    assert_eq!(metrics.attempts(AttemptOutcome::CircuitOpen), 0);
    assert_eq!(metrics.delivered(), 1);
    assert_eq!(metrics.retries(), 1);
    assert_eq!(metrics.permanently_failed(), 0);
    assert_eq!(metrics.queue_size(), 0);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_metrics_record_permanent_failure() {
    let metrics: &'static DeliveryMetrics = Box::leak(Box::new(
        DeliveryMetrics::new().expect("Failed to create delivery metrics"),
    ));
    let processor = DeliveryProcessor::new(config(100, 60_000, 1, 100, 1_000), MockChannel::failing())
        .expect("valid configuration")
        .with_metrics(metrics);
    let mut harness = Harness::serving(processor);

    harness
        .processor
        .submit("+15550000001", "hello", Priority::Low);
    harness.collect_until(1, is_permanently_failed).await;

    assert_eq!(metrics.attempts(AttemptOutcome::ChannelFailure), 2);
    assert_eq!(metrics.attempts(AttemptOutcome::Delivered), 0);
    assert_eq!(metrics.retries(), 1);
    assert_eq!(metrics.permanently_failed(), 1);
    assert_eq!(metrics.delivered(), 0);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_after_in_flight_attempt() {
    let channel = MockChannel::with_latency(Duration::from_secs(1));
    let harness = Harness::start(DeliveryConfig::default(), Arc::clone(&channel));

    for n in 0..3 {
        harness
            .processor
            .submit("+15550000000", format!("m{n}"), Priority::Normal);
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.call_times().len(), 1);

    let processor = Arc::clone(&harness.processor);
    harness.stop().await;

    // Nothing else is dequeued once shutdown has begun
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.calls(), vec!["m0"]);
    assert_eq!(processor.pending_messages().len(), 2);
    assert_eq!(processor.queue_status().size, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_aborts_stuck_delivery() {
    let channel = MockChannel::with_latency(Duration::from_secs(60));
    let config = DeliveryConfig {
        shutdown_timeout_secs: 1,
        ..DeliveryConfig::default()
    };
    let harness = Harness::start(config, Arc::clone(&channel));

    harness
        .processor
        .submit("+15550000001", "stuck", Priority::Normal);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.call_times().len(), 1);

    let processor = Arc::clone(&harness.processor);
    let started = tokio::time::Instant::now();
    harness.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    // The aborted call never completes
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(channel.calls().is_empty());
    assert_eq!(processor.pending_messages().len(), 1);
}
