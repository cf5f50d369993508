//! Retry logic with exponential backoff

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use tokio::time::Instant;

/// Calculate the delay before the next attempt using exponential backoff
///
/// # Formula
/// `delay = min(base * multiplier^attempts, max_delay)`
///
/// # Arguments
/// * `attempts` - Attempts made so far, including the one that just failed
/// * `base_delay_ms` - Base delay in milliseconds
/// * `max_delay_ms` - Maximum delay in milliseconds
/// * `multiplier` - Growth factor between consecutive delays
pub fn calculate_backoff(
    attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);

    // Intentional precision loss, delays are far below 2^52 milliseconds
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let delay_ms = {
        let delay = (base_delay_ms as f64) * multiplier.powi(exponent);
        if !delay.is_finite() || delay >= max_delay_ms as f64 {
            max_delay_ms
        } else {
            delay.max(0.0) as u64
        }
    };

    Duration::from_millis(delay_ms)
}

#[derive(Debug)]
struct Scheduled<T> {
    due: Instant,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Items parked until a deadline, released earliest first
///
/// Items sharing a deadline are released in the order they were scheduled.
#[derive(Debug)]
pub struct RetryScheduler<T> {
    heap: BinaryHeap<Reverse<Scheduled<T>>>,
    next_sequence: u64,
}

impl<T> Default for RetryScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RetryScheduler<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Park `item` until `due`
    pub fn schedule(&mut self, item: T, due: Instant) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.heap.push(Reverse(Scheduled {
            due,
            sequence,
            item,
        }));
    }

    /// Earliest pending deadline
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(scheduled)| scheduled.due)
    }

    /// Remove and return every item whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();

        while self
            .heap
            .peek()
            .is_some_and(|Reverse(scheduled)| scheduled.due <= now)
        {
            if let Some(Reverse(scheduled)) = self.heap.pop() {
                due.push(scheduled.item);
            }
        }

        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
