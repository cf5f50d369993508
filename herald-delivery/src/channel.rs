//! The external channel messages are delivered to
//!
//! The pipeline treats the channel as opaque: it may be slow, it may fail,
//! and every failure is handled the same way regardless of its cause.

use async_trait::async_trait;
use thiserror::Error;

/// Acknowledgement returned by the channel for an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Channel-assigned identifier for the accepted message
    pub id: String,
}

impl Receipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A failed channel call, carrying a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ChannelError {
    reason: String,
}

impl ChannelError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Transport that performs the actual send
///
/// ```rust,ignore
/// #[async_trait]
/// impl ExternalChannel for Carrier {
///     async fn send(&self, destination: &str, payload: &str) -> Result<Receipt, ChannelError> {
///         self.client.post(destination, payload).await.map_err(|e| ChannelError::new(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait ExternalChannel: Send + Sync {
    /// Deliver `payload` to `destination`
    async fn send(&self, destination: &str, payload: &str) -> Result<Receipt, ChannelError>;
}
