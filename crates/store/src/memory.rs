use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId, Version};
use tokio::sync::RwLock;

use crate::record::{InboxRecord, OutboxRecord, StoredSaga};
use crate::store::{SagaStore, SagaUpdate};
use crate::{Result, StoreError};

#[derive(Default)]
struct Inner {
    sagas: HashMap<CorrelationId, StoredSaga>,
    outbox: Vec<OutboxRecord>,
    inbox: HashSet<(EventId, String)>,
}

/// In-memory store implementation for testing.
///
/// A single write lock around all three tables gives the same atomicity as
/// the Postgres transaction: a commit that fails its version or dedup check
/// leaves nothing behind.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of outbox records, published or not.
    pub async fn outbox_len(&self) -> usize {
        self.inner.read().await.outbox.len()
    }

    /// Returns the number of unpublished outbox records.
    pub async fn unpublished_len(&self) -> usize {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .filter(|r| r.published_at.is_none())
            .count()
    }

    /// Returns all outbox records with the given routing key.
    pub async fn outbox_by_routing_key(&self, routing_key: &str) -> Vec<OutboxRecord> {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .filter(|r| r.routing_key == routing_key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SagaStore for InMemoryStore {
    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<StoredSaga>> {
        Ok(self.inner.read().await.sagas.get(&correlation_id).cloned())
    }

    async fn commit(&self, update: SagaUpdate) -> Result<Version> {
        let mut inner = self.inner.write().await;

        // Validate everything before mutating anything.
        if let Some((saga, expected)) = &update.saga {
            let actual = inner
                .sagas
                .get(&saga.correlation_id)
                .map(|s| s.version)
                .unwrap_or(Version::initial());
            if actual != *expected {
                return Err(StoreError::ConcurrencyConflict {
                    correlation_id: saga.correlation_id,
                    expected: *expected,
                    actual,
                });
            }
        }

        if let Some(inbox) = &update.inbox {
            let key = (inbox.event_id, inbox.consumer.clone());
            if inner.inbox.contains(&key) {
                return Err(StoreError::DuplicateEvent {
                    event_id: inbox.event_id,
                });
            }
        }

        let mut version = update
            .saga
            .as_ref()
            .map(|(_, expected)| *expected)
            .unwrap_or(Version::initial());

        if let Some((saga, _)) = update.saga {
            version = saga.version;
            inner.sagas.insert(saga.correlation_id, saga);
        }
        inner.outbox.extend(update.outbox);
        if let Some(inbox) = update.inbox {
            inner.inbox.insert((inbox.event_id, inbox.consumer));
        }

        Ok(version)
    }

    async fn is_processed(&self, event_id: EventId, consumer: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .inbox
            .contains(&(event_id, consumer.to_string())))
    }

    async fn fetch_unpublished(
        &self,
        shard: usize,
        shard_count: usize,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        let inner = self.inner.read().await;
        // Insertion index mirrors the Postgres seq column as the tiebreak
        // for records sharing a created_at.
        let mut records: Vec<_> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.published_at.is_none() && (r.partition_key as usize) % shard_count == shard
            })
            .map(|(seq, r)| (seq, r.clone()))
            .collect();
        records.sort_by_key(|(seq, r)| (r.created_at, *seq));
        Ok(records
            .into_iter()
            .take(limit)
            .map(|(_, r)| r)
            .collect())
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner
            .outbox
            .iter_mut()
            .find(|r| r.event_id == event_id && r.published_at.is_none())
        {
            record.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.outbox.len();
        inner
            .outbox
            .retain(|r| !matches!(r.published_at, Some(at) if at < cutoff));
        Ok((before - inner.outbox.len()) as u64)
    }
}
