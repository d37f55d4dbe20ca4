//! Store error types.

use common::{CorrelationId, EventId, Version};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The saga was updated by someone else since it was read. Retryable:
    /// re-read the current state and re-evaluate the transition.
    #[error("concurrency conflict on {correlation_id}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// The inbox ledger already holds this event id for this consumer.
    /// A redelivery race, not a failure; the caller treats it as a no-op.
    #[error("event {event_id} already processed")]
    DuplicateEvent { event_id: EventId },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
