//! A stand-in external channel with tunable reliability
//!
//! Every call waits for the configured response time, then fails with the
//! configured probability. Both knobs can be changed while deliveries are in
//! flight.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use herald_delivery::{ChannelError, ExternalChannel, Receipt};
use rand::{Rng, distr::Alphanumeric};
use serde::Deserialize;

/// Shortest response time the channel will simulate
pub const MIN_RESPONSE_TIME: Duration = Duration::from_millis(100);

const fn default_failure_rate() -> f64 {
    0.3
}

const fn default_response_time_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedConfig {
    /// Probability in `[0, 1]` that a call fails
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// How long every call takes (in milliseconds, at least 100)
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            failure_rate: default_failure_rate(),
            response_time_ms: default_response_time_ms(),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedChannel {
    /// `f64` bits
    failure_rate: AtomicU64,
    response_time_ms: AtomicU64,
}

impl SimulatedChannel {
    pub fn new(config: &SimulatedConfig) -> Self {
        let channel = Self {
            failure_rate: AtomicU64::new(0),
            response_time_ms: AtomicU64::new(0),
        };
        channel.set_failure_rate(config.failure_rate);
        channel.set_response_time(Duration::from_millis(config.response_time_ms));
        channel
    }

    /// Set the failure probability, clamped to `[0, 1]`
    pub fn set_failure_rate(&self, rate: f64) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self.failure_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn failure_rate(&self) -> f64 {
        f64::from_bits(self.failure_rate.load(Ordering::Relaxed))
    }

    /// Set the per-call latency, raised to [`MIN_RESPONSE_TIME`] if shorter
    pub fn set_response_time(&self, response_time: Duration) {
        let millis = u64::try_from(response_time.max(MIN_RESPONSE_TIME).as_millis())
            .unwrap_or(u64::MAX);
        self.response_time_ms.store(millis, Ordering::Relaxed);
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms.load(Ordering::Relaxed))
    }
}

fn receipt_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(7)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();

    format!("msg_{millis}_{suffix}")
}

#[async_trait]
impl ExternalChannel for SimulatedChannel {
    async fn send(&self, _destination: &str, _payload: &str) -> Result<Receipt, ChannelError> {
        tokio::time::sleep(self.response_time()).await;

        let roll: f64 = rand::rng().random();
        if roll < self.failure_rate() {
            return Err(ChannelError::new("SMS API temporarily unavailable"));
        }

        Ok(Receipt::new(receipt_id()))
    }
}
