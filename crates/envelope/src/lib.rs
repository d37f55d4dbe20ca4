//! The standardized event wrapper exchanged over the broker.
//!
//! Every producer encodes its events through this crate and every consumer
//! decodes through it, so the wire contract lives in exactly one place.

mod codec;
mod error;
mod payload;
mod wrapper;

pub use codec::{content_hash, decode, encode};
pub use error::EnvelopeError;
pub use payload::{EventPayload, EventType, LineItem};
pub use wrapper::{Envelope, SCHEMA_VERSION};

/// Convenience type alias for envelope results.
pub type Result<T> = std::result::Result<T, EnvelopeError>;
