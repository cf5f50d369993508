//! Circuit breaker guarding calls to the external channel
//!
//! Protects an unreliable channel from being hammered while it is down, and
//! lets the pipeline fail fast instead of waiting on calls that will not
//! succeed.
//!
//! # Circuit Breaker Pattern
//!
//! The circuit breaker has three states:
//! - **Closed**: Normal operation, all calls admitted
//! - **Open**: Circuit tripped, calls rejected immediately without touching the channel
//! - **Half-Open**: Probing recovery, calls admitted and watched closely
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  failure_count >= threshold  ┌──────┐
//! │ Closed  │ ──────────────────────────>  │ Open │ <──────────┐
//! └─────────┘                              └──────┘            │
//!     ^                                        │               │
//!     │                                        │ reset timeout │
//!     │                                        │ elapsed, on   │
//!     │                                        │ next admission│
//!     │  3 consecutive       ┌───────────────┐ v               │
//!     └──────────────────────│  Half-Open    │─────────────────┘
//!        successes           └───────────────┘   any failure
//! ```
//!
//! No timer drives Open → Half-Open. The transition is checked lazily when the
//! next call asks for admission. Every transition is published to subscribers
//! of [`CircuitBreaker::subscribe`].
//!
//! # Example
//!
//! ```text
//! Threshold: 3 failures
//! Reset timeout: 5 seconds
//!
//! t=0.0s: Closed (normal)
//! t=0.2s: 3rd consecutive failure → Open
//! t=2.0s: admission requested → rejected, channel not called
//! t=6.0s: admission requested → Half-Open, probe admitted
//! t=6.1s: probe fails → Open again
//! ```

use std::{fmt, future::Future, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

use crate::error::DeliveryError;

/// Consecutive Half-Open successes needed to close the circuit
pub const SUCCESSES_TO_CLOSE: u32 = 3;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long after the last failure the circuit stays open before probing (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Reserved. Accepted in configuration but not used by the trip logic.
    #[serde(default = "default_monitoring_period_ms")]
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            monitoring_period_ms: default_monitoring_period_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    60_000
}

const fn default_monitoring_period_ms() -> u64 {
    10_000
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls admitted
    Closed,
    /// Circuit tripped - reject all calls immediately
    Open,
    /// Testing recovery - calls admitted, any failure re-trips
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admitted,
    /// Admitted as the first probe after the reset timeout
    Probing,
    Rejected,
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    /// Consecutive failures, reset by any success
    failure_count: u32,
    /// Consecutive successes while Half-Open
    success_count: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreakerData {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
        }
    }

    fn is_reset_timeout_expired(&self, reset_timeout: Duration) -> bool {
        self.last_failure_at
            .is_some_and(|last_failure| last_failure.elapsed() >= reset_timeout)
    }

    fn admit(&mut self, reset_timeout: Duration) -> Admission {
        match self.state {
            CircuitState::Open => {
                if self.is_reset_timeout_expired(reset_timeout) {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    Admission::Probing
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Admitted,
        }
    }

    /// Returns the new state if the success closed the circuit
    const fn record_success(&mut self) -> Option<CircuitState> {
        self.failure_count = 0;

        if let CircuitState::HalfOpen = self.state {
            self.success_count += 1;
            if self.success_count >= SUCCESSES_TO_CLOSE {
                self.state = CircuitState::Closed;
                self.success_count = 0;
                return Some(CircuitState::Closed);
            }
        }

        None
    }

    /// Returns the new state if the failure opened the circuit
    fn record_failure(&mut self, threshold: u32) -> Option<CircuitState> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(Instant::now());

        let trips = match self.state {
            CircuitState::Closed => self.failure_count >= threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trips {
            self.state = CircuitState::Open;
            self.success_count = 0;
            Some(CircuitState::Open)
        } else {
            None
        }
    }
}

/// Circuit breaker around a single external dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    data: Mutex<CircuitBreakerData>,
    state_changes: broadcast::Sender<CircuitState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (state_changes, _) = broadcast::channel(64);

        Self {
            config,
            data: Mutex::new(CircuitBreakerData::new()),
            state_changes,
        }
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitState> {
        self.state_changes.subscribe()
    }

    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Get statistics (for status queries and debugging)
    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            failure_count: data.failure_count,
            success_count: data.success_count,
        }
    }

    /// Check if a call should be admitted
    ///
    /// An open circuit whose reset timeout has elapsed moves to Half-Open and
    /// admits the call.
    pub fn should_allow_call(&self) -> bool {
        let admission = self.data.lock().admit(self.config.reset_timeout());

        match admission {
            Admission::Admitted => true,
            Admission::Probing => {
                info!("Circuit breaker entering HALF-OPEN state - testing recovery");
                self.notify(CircuitState::HalfOpen);
                true
            }
            Admission::Rejected => false,
        }
    }

    /// Record a successful call
    ///
    /// Returns `true` if the circuit transitioned to Closed (recovered)
    pub fn record_success(&self) -> bool {
        let transition = self.data.lock().record_success();

        transition.is_some_and(|state| {
            info!("Circuit breaker CLOSED - normal operation resumed");
            self.notify(state);
            true
        })
    }

    /// Record a failed call
    ///
    /// Returns `true` if the circuit transitioned to Open (tripped)
    pub fn record_failure(&self) -> bool {
        let transition = self.data.lock().record_failure(self.config.failure_threshold);

        transition.is_some_and(|state| {
            warn!(
                threshold = self.config.failure_threshold,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit breaker OPENED - rejecting calls to protect the channel"
            );
            self.notify(state);
            true
        })
    }

    /// Run `operation` through the breaker
    ///
    /// The operation is invoked exactly once if admitted and never if
    /// rejected. Its outcome is returned as-is after the counters, and any
    /// resulting transition, have been updated.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::CircuitOpen`] if the call was rejected, or the
    /// operation's own error converted into a [`DeliveryError`].
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, DeliveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<DeliveryError>,
    {
        if !self.should_allow_call() {
            debug!("Circuit breaker is OPEN - rejecting call");
            return Err(DeliveryError::CircuitOpen);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error.into())
            }
        }
    }

    fn notify(&self, state: CircuitState) {
        // No subscribers is fine, the transition itself already happened
        let _ = self.state_changes.send(state);
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Number of consecutive failures
    pub failure_count: u32,
    /// Number of consecutive successes in half-open state
    pub success_count: u32,
}
