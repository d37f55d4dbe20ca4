//! Persisted record shapes.

use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId, Version, partition_for};
use envelope::Envelope;
use serde::{Deserialize, Serialize};

/// Number of buckets used for the persisted outbox partition key.
///
/// The relay maps this key onto its configured shard count with a modulo, so
/// the stored value does not change when the shard count does.
const PARTITION_BUCKETS: usize = 1024;

/// An event recorded alongside the business state change that caused it.
///
/// Lives in the same transactional boundary as that change and is relayed to
/// the broker at least once by the outbox relay; `published_at` is stamped
/// once delivery succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: EventId,
    pub aggregate_id: CorrelationId,
    /// Broker routing key; the event type's wire name.
    pub routing_key: String,
    /// The encoded envelope as JSON.
    pub payload: serde_json::Value,
    /// Stable partition bucket derived from `aggregate_id`.
    pub partition_key: i64,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Creates an unpublished record carrying the given envelope.
    pub fn for_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: envelope.event_id,
            aggregate_id: envelope.correlation_id,
            routing_key: envelope.routing_key().to_string(),
            payload: serde_json::to_value(envelope)?,
            partition_key: partition_for(envelope.correlation_id, PARTITION_BUCKETS) as i64,
            created_at: Utc::now(),
            published_at: None,
        })
    }

    /// Returns the encoded envelope bytes to hand to the broker.
    pub fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}

/// Dedup ledger entry: the first time a consumer sees an event id, one of
/// these is written in the same transaction as the handler's effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub event_id: EventId,
    pub consumer: String,
    pub processed_at: DateTime<Utc>,
}

impl InboxRecord {
    /// Creates a ledger entry processed now.
    pub fn new(event_id: EventId, consumer: impl Into<String>) -> Self {
        Self {
            event_id,
            consumer: consumer.into(),
            processed_at: Utc::now(),
        }
    }
}

/// Opaque persisted snapshot of a saga aggregate.
///
/// The saga crate owns the typed state; the store only sees JSON plus the
/// optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSaga {
    pub correlation_id: CorrelationId,
    pub state: serde_json::Value,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

impl StoredSaga {
    /// Creates a snapshot at the given version.
    pub fn new(correlation_id: CorrelationId, state: serde_json::Value, version: Version) -> Self {
        Self {
            correlation_id,
            state,
            version,
            updated_at: Utc::now(),
        }
    }
}
