//! The envelope itself.

use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId};
use serde::{Deserialize, Serialize};

use crate::payload::{EventPayload, EventType};

/// The schema major version this codebase produces and accepts.
pub const SCHEMA_VERSION: u32 = 1;

/// The unit exchanged over the broker.
///
/// An envelope is append-only: once published it is never mutated, only
/// superseded by a new envelope with its own `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique identifier; the deduplication key.
    pub event_id: EventId,

    /// Timestamp of the originating state change, not the publish time.
    pub occurred_at: DateTime<Utc>,

    /// Name of the emitting service.
    pub source_service: String,

    /// The saga instance (invoice) this event belongs to.
    pub correlation_id: CorrelationId,

    /// Schema major version; consumers reject unknown versions.
    pub schema_version: u32,

    /// Event type tag and typed payload (adjacent `event_type`/`payload`
    /// fields on the wire).
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Envelope {
    /// Creates an envelope for a state change that occurred now.
    pub fn new(
        source_service: impl Into<String>,
        correlation_id: CorrelationId,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: Utc::now(),
            source_service: source_service.into(),
            correlation_id,
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }

    /// Overrides the state-change timestamp.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Returns the event type of the payload.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Returns the broker routing key for this envelope.
    pub fn routing_key(&self) -> &'static str {
        self.event_type().as_str()
    }
}
