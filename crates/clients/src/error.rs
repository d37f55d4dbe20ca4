//! Client error types.

use thiserror::Error;

/// Errors from collaborator calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Retryable: timeout, lost connection, or a server-side error.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Not retryable: the collaborator rejected the request.
    #[error("permanent failure{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    /// The breaker is open; the call was not attempted.
    #[error("circuit open for {collaborator}")]
    CircuitOpen { collaborator: String },

    /// Every attempt failed transiently.
    #[error("{collaborator} unavailable after {attempts} attempts: {last}")]
    RetriesExhausted {
        collaborator: String,
        attempts: u32,
        last: String,
    },
}

impl ClientError {
    /// True if retrying could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }
}
