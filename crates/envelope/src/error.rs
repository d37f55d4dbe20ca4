//! Envelope codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope carries a schema version this consumer does not know.
    #[error("unsupported schema version {found} (supported: {supported})")]
    SchemaVersion { found: u32, supported: u32 },

    /// Required fields are absent or of the wrong shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}
