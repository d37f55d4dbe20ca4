//! The storage contract shared by the in-memory and Postgres backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId, Version};

use crate::record::{InboxRecord, OutboxRecord, StoredSaga};
use crate::Result;

/// One atomic unit of work: an optional version-checked saga upsert, the
/// outbox events produced by that change, and the inbox record marking the
/// inbound event that caused it.
///
/// Everything in an update commits or rolls back together. This is the
/// explicit replacement for relying on a web framework's transaction scope:
/// no event is ever published for a state change that did not commit, and no
/// inbound event is marked processed unless its effects did.
#[derive(Debug, Default)]
pub struct SagaUpdate {
    /// New saga snapshot plus the version the caller read. Committing fails
    /// with `ConcurrencyConflict` if the stored version has moved on.
    pub saga: Option<(StoredSaga, Version)>,
    /// Outbox records inserted with the update.
    pub outbox: Vec<OutboxRecord>,
    /// Inbox ledger entry inserted with the update. Committing fails with
    /// `DuplicateEvent` if the ledger already holds the event id.
    pub inbox: Option<InboxRecord>,
}

impl SagaUpdate {
    /// An update that persists a saga snapshot, checked against the version
    /// the caller read.
    pub fn saga(saga: StoredSaga, expected: Version) -> Self {
        Self {
            saga: Some((saga, expected)),
            ..Self::default()
        }
    }

    /// Adds an outbox record to the update.
    pub fn with_outbox(mut self, record: OutboxRecord) -> Self {
        self.outbox.push(record);
        self
    }

    /// Adds an inbox ledger entry to the update.
    pub fn with_inbox(mut self, record: InboxRecord) -> Self {
        self.inbox = Some(record);
        self
    }

    /// An update that only marks an inbound event processed.
    pub fn inbox_only(record: InboxRecord) -> Self {
        Self {
            inbox: Some(record),
            ..Self::default()
        }
    }
}

/// Storage owned by one service: saga snapshots, outbox, and inbox ledger.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the saga snapshot for a correlation id, if one exists.
    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<StoredSaga>>;

    /// Commits an update atomically.
    ///
    /// Returns the new saga version (or the expected version unchanged when
    /// the update carries no saga snapshot).
    async fn commit(&self, update: SagaUpdate) -> Result<Version>;

    /// Returns true if the consumer has already processed the event.
    async fn is_processed(&self, event_id: EventId, consumer: &str) -> Result<bool>;

    /// Fetches unpublished outbox records for one relay shard, oldest first.
    async fn fetch_unpublished(
        &self,
        shard: usize,
        shard_count: usize,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>>;

    /// Stamps `published_at` on an outbox record after broker delivery.
    ///
    /// Idempotent: stamping an already-published record is a no-op, so a
    /// relay crash between publish and stamp results only in a benign
    /// republish.
    async fn mark_published(&self, event_id: EventId) -> Result<()>;

    /// Deletes published outbox records older than the cutoff (retention
    /// sweep).
    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
