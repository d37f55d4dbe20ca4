//! Saga error types.

use clients::ClientError;
use common::CorrelationId;
use store::StoreError;
use thiserror::Error;

use crate::state::InvoiceStatus;

/// Errors from saga transitions and orchestration.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The requested transition is not legal from the current status.
    #[error("cannot {action} an invoice in status {status}")]
    InvalidTransition {
        status: InvoiceStatus,
        action: &'static str,
    },

    /// A second terminal payment outcome arrived after the first was
    /// durably applied.
    #[error("invoice already settled as {status}, rejecting {attempted}")]
    ConflictingTransition {
        status: InvoiceStatus,
        attempted: &'static str,
    },

    /// Cancellation requested after payment settled; needs a refund
    /// workflow, not a cancellation.
    #[error("cannot cancel an invoice in status {status}")]
    CancellationRejected { status: InvoiceStatus },

    /// No saga exists for the correlation id.
    #[error("no saga for correlation id {0}")]
    NotFound(CorrelationId),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Collaborator call failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Snapshot (de)serialization failure.
    #[error("saga snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
