//! Scripted demonstration run against the simulated channel
//!
//! Submits a handful of messages while the channel is unreliable, then
//! improves the channel part way through so the breaker can be seen
//! tripping, probing and recovering.

use std::{future, sync::Arc, time::Duration};

use herald_common::incoming;
use herald_delivery::{DeliveryProcessor, DeliveryQueryService, Priority};
use serde::Deserialize;
use tracing::info;

use crate::simulated::SimulatedChannel;

/// A message submitted at the start of the demo
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub destination: &'static str,
    pub payload: &'static str,
    pub priority: Priority,
}

pub const SAMPLES: [Sample; 5] = [
    Sample {
        destination: "+1234567890",
        payload: "High priority alert!",
        priority: Priority::High,
    },
    Sample {
        destination: "+1234567891",
        payload: "Normal message",
        priority: Priority::Normal,
    },
    Sample {
        destination: "+1234567892",
        payload: "Low priority update",
        priority: Priority::Low,
    },
    Sample {
        destination: "+1234567893",
        payload: "Another normal message",
        priority: Priority::Normal,
    },
    Sample {
        destination: "+1234567894",
        payload: "Emergency notification",
        priority: Priority::High,
    },
];

const fn default_enabled() -> bool {
    true
}

const fn default_failure_rate() -> f64 {
    0.8
}

const fn default_improve_after_secs() -> u64 {
    8
}

const fn default_improved_failure_rate() -> f64 {
    0.1
}

const fn default_improved_response_time_ms() -> u64 {
    500
}

const fn default_status_interval_secs() -> u64 {
    3
}

#[allow(clippy::unnecessary_wraps)]
const fn default_duration_secs() -> Option<u64> {
    Some(30)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Channel failure rate while the sample messages are submitted
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Delay before the channel becomes more reliable (in seconds)
    #[serde(default = "default_improve_after_secs")]
    pub improve_after_secs: u64,

    #[serde(default = "default_improved_failure_rate")]
    pub improved_failure_rate: f64,

    #[serde(default = "default_improved_response_time_ms")]
    pub improved_response_time_ms: u64,

    /// How often queue status is reported (in seconds)
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// Stop after this long (in seconds), `None` runs until interrupted
    #[serde(default = "default_duration_secs")]
    pub duration_secs: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_rate: default_failure_rate(),
            improve_after_secs: default_improve_after_secs(),
            improved_failure_rate: default_improved_failure_rate(),
            improved_response_time_ms: default_improved_response_time_ms(),
            status_interval_secs: default_status_interval_secs(),
            duration_secs: default_duration_secs(),
        }
    }
}

/// Log the current queue and breaker status
pub fn report_status(service: &dyn DeliveryQueryService) {
    let status = service.queue_status();
    let pending = service.pending_messages().len();

    info!(
        "Status - Queue: {}, Pending: {pending}, Circuit: {}",
        status.size, status.breaker_state
    );
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => future::pending().await,
    }
}

/// Run the demo until its configured duration elapses
///
/// Never returns if no duration is configured.
pub async fn run(
    config: DemoConfig,
    processor: Arc<DeliveryProcessor>,
    channel: Arc<SimulatedChannel>,
) {
    info!(
        "Setting failure rate to {} to demonstrate the circuit breaker",
        config.failure_rate
    );
    channel.set_failure_rate(config.failure_rate);

    for sample in SAMPLES {
        let submission = processor.submit(sample.destination, sample.payload, sample.priority);
        incoming!(
            level = INFO,
            "Submitted: {} - Status: {}",
            submission.message_id,
            submission.status
        );
    }

    let improve = tokio::time::sleep(Duration::from_secs(config.improve_after_secs));
    let finished = sleep_for(config.duration_secs.map(Duration::from_secs));
    tokio::pin!(improve, finished);

    let period = Duration::from_secs(config.status_interval_secs.max(1));
    let mut status = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut improved = false;

    loop {
        tokio::select! {
            () = &mut improve, if !improved => {
                improved = true;
                info!("Improving channel reliability...");
                channel.set_failure_rate(config.improved_failure_rate);
                channel.set_response_time(Duration::from_millis(config.improved_response_time_ms));
            }
            _ = status.tick() => {
                report_status(&*processor);
            }
            () = &mut finished => {
                report_status(&*processor);
                info!("Demo completed");
                break;
            }
        }
    }
}
