//! Retry policy for delivery operations.
//!
//! This module provides a clean abstraction over retry configuration and logic,
//! making it easy to test and reason about retry behavior independently of the
//! delivery processor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::SystemError, queue::retry::calculate_backoff};

/// Retry policy configuration for delivery operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    ///
    /// A message gets `max_retries + 1` attempts in total.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The actual delay is calculated as: `base * multiplier^attempts`
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum retry delay (in milliseconds).
    ///
    /// Default: 10000 milliseconds
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays, no jitter is applied.
    ///
    /// Default: 2.0
    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Total attempts a message gets, first attempt included.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the next attempt, given the attempts made so far.
    ///
    /// The first retry is computed with `attempt_count == 1`.
    #[must_use]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        calculate_backoff(
            attempt_count,
            self.base_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
        )
    }

    /// Reject policies that would shrink or never converge.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Configuration`] if the multiplier is below 1 or
    /// not finite, or if the base delay exceeds the maximum delay.
    pub fn validate(&self) -> Result<(), SystemError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SystemError::Configuration(format!(
                "backoff_multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(SystemError::Configuration(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }

        Ok(())
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        1_000
    }

    pub const fn max_delay_ms() -> u64 {
        10_000
    }

    pub const fn backoff_multiplier() -> f64 {
        2.0
    }
}
