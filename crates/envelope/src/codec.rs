//! Encoding and decoding of envelopes.
//!
//! Encoding is deterministic for identical input: struct and enum fields are
//! written in declaration order, which makes the encoded bytes usable as the
//! input of a content hash.

use sha2::{Digest, Sha256};

use crate::error::EnvelopeError;
use crate::wrapper::{Envelope, SCHEMA_VERSION};

/// Encodes an envelope to its wire representation.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(envelope).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Decodes an envelope from its wire representation.
///
/// An unknown `schema_version` is rejected before shape validation so that a
/// consumer never misreads fields from a future schema; any other missing or
/// ill-typed field is a `Malformed` error. Both are permanent failures.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid JSON: {e}")))?;

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| EnvelopeError::Malformed("missing schema_version".to_string()))?;

    if version != u64::from(SCHEMA_VERSION) {
        return Err(EnvelopeError::SchemaVersion {
            found: version.try_into().unwrap_or(u32::MAX),
            supported: SCHEMA_VERSION,
        });
    }

    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Returns the SHA-256 hex digest of the canonical encoding.
///
/// Secondary deduplication key for consumers that want to detect republished
/// envelopes that were assigned a fresh `event_id`.
pub fn content_hash(envelope: &Envelope) -> Result<String, EnvelopeError> {
    let bytes = encode(envelope)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}
