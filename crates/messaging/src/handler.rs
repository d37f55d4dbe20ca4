//! Handler contract for inbound events.

use async_trait::async_trait;
use common::Version;
use envelope::Envelope;
use store::{OutboxRecord, StoredSaga};
use thiserror::Error;

/// How a handler failed.
///
/// The dispatcher retries `Transient` failures with backoff and dead-letters
/// the other two without retrying.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retryable: timeouts, lost connections, optimistic-concurrency races.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not retryable: malformed or semantically invalid input.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The saga already settled with a different terminal outcome; needs an
    /// operator, not a retry.
    #[error("conflicting transition: {0}")]
    ConflictingTransition(String),
}

/// State changes a handler wants committed, minus the inbox ledger entry
/// that the dispatcher adds itself.
#[derive(Debug, Default)]
pub struct HandlerEffects {
    /// New saga snapshot plus the version the handler read.
    pub saga: Option<(StoredSaga, Version)>,
    /// Follow-on events to publish through the outbox.
    pub outbox: Vec<OutboxRecord>,
}

impl HandlerEffects {
    /// Effects that change nothing; the event is still marked processed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Effects that persist a saga snapshot, checked against the version the
    /// handler read.
    pub fn saga(saga: StoredSaga, expected: Version) -> Self {
        Self {
            saga: Some((saga, expected)),
            ..Self::default()
        }
    }

    /// Adds a follow-on outbox record.
    pub fn with_outbox(mut self, record: OutboxRecord) -> Self {
        self.outbox.push(record);
        self
    }
}

/// Processes one decoded inbound event.
///
/// Handlers must be idempotent in intent but may rely on the dispatcher for
/// dedup: a duplicate event id never reaches `handle` a second time once the
/// first invocation's effects have committed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The routing keys this handler consumes.
    fn routing_keys(&self) -> Vec<&'static str>;

    /// Computes the effects of one event. Called again with the same
    /// envelope on transient failure or commit conflict.
    async fn handle(&self, envelope: &Envelope) -> Result<HandlerEffects, HandlerError>;
}
