//! Messaging error types.

use envelope::EnvelopeError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur in the relay and dispatcher.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Envelope codec error.
    #[error("codec error: {0}")]
    Codec(#[from] EnvelopeError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Broker delivery failure; transient from the relay's point of view.
    #[error("broker error: {0}")]
    Broker(String),
}
