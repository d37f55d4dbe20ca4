//! Dead-letter escalation queue.
//!
//! Holds deliveries that could not be processed: decode failures, permanent
//! handler errors, exhausted retries, and conflicting terminal transitions
//! awaiting an operator. Nothing lands here without a correlation-tagged log
//! record.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId};

/// Why a delivery was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The envelope could not be decoded or failed cross-field validation;
    /// permanent, never retried.
    DecodeFailure(String),
    /// The handler reported a permanent failure.
    HandlerPermanent(String),
    /// Transient failures exhausted the retry budget.
    RetriesExhausted(String),
    /// A second terminal transition for a saga that already settled.
    ConflictingTransition(String),
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::DecodeFailure(msg) => write!(f, "decode failure: {msg}"),
            DeadLetterReason::HandlerPermanent(msg) => write!(f, "permanent failure: {msg}"),
            DeadLetterReason::RetriesExhausted(msg) => write!(f, "retries exhausted: {msg}"),
            DeadLetterReason::ConflictingTransition(msg) => {
                write!(f, "conflicting transition: {msg}")
            }
        }
    }
}

/// A dead-lettered delivery, kept whole for manual remediation.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    /// Absent when the body never decoded.
    pub event_id: Option<EventId>,
    pub correlation_id: Option<CorrelationId>,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub reason: DeadLetterReason,
    /// Handler attempts made before giving up.
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// In-memory dead-letter queue shared by dispatcher workers.
#[derive(Clone, Default)]
pub struct DeadLetterQueue {
    records: Arc<RwLock<Vec<DeadLetterRecord>>>,
}

impl DeadLetterQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, logging it for operator traceability.
    pub fn push(&self, record: DeadLetterRecord) {
        tracing::error!(
            correlation_id = record.correlation_id.map(|id| id.to_string()),
            event_id = record.event_id.map(|id| id.to_string()),
            routing_key = %record.routing_key,
            attempts = record.attempts,
            reason = %record.reason,
            "message dead-lettered"
        );
        metrics::counter!("dead_letters_total").increment(1);
        self.records.write().unwrap().push(record);
    }

    /// Returns the number of dead-lettered messages.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of all records.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().unwrap().clone()
    }

    /// Removes and returns a record for manual redelivery.
    pub fn take(&self, event_id: EventId) -> Option<DeadLetterRecord> {
        let mut records = self.records.write().unwrap();
        let index = records
            .iter()
            .position(|r| r.event_id == Some(event_id))?;
        Some(records.remove(index))
    }
}
