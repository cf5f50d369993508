//! Scriptable external channel for exercising delivery scenarios
//!
//! The channel can:
//! - Succeed or fail every call, switchable at runtime
//! - Fail only the first N calls
//! - Delay every call to exercise timeouts and in-flight shutdown
//! - Record every payload it was asked to send, in call order
//! - Record when each call started, on the tokio clock

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_delivery::{ChannelError, ExternalChannel, Receipt};
use parking_lot::Mutex;
use tokio::time::Instant;

pub const FAILURE_REASON: &str = "SMS API temporarily unavailable";

#[derive(Debug, Default)]
pub struct MockChannel {
    failing: AtomicBool,
    failures_remaining: AtomicUsize,
    latency: Duration,
    calls: Mutex<Vec<String>>,
    started: Mutex<Vec<Instant>>,
}

impl MockChannel {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        })
    }

    /// Fail the first `count` calls, then succeed
    pub fn failing_first(count: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(count),
            ..Self::default()
        })
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Payloads in the order they reached the channel
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// When each call reached the channel, before any latency
    pub fn call_times(&self) -> Vec<Instant> {
        self.started.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }

        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExternalChannel for MockChannel {
    async fn send(&self, _destination: &str, payload: &str) -> Result<Receipt, ChannelError> {
        self.started.lock().push(Instant::now());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let call = {
            let mut calls = self.calls.lock();
            calls.push(payload.to_string());
            calls.len()
        };

        if self.should_fail() {
            Err(ChannelError::new(FAILURE_REASON))
        } else {
            Ok(Receipt::new(format!("sms_{call}")))
        }
    }
}
