//! Policy abstractions for delivery operations.
//!
//! Policy logic lives apart from the processor so it can be tested as plain
//! functions over plain structs.
//!
//! ## Policies
//!
//! - [`RetryPolicy`]: Determines the attempt budget and backoff timing

pub mod retry;

pub use retry::RetryPolicy;
