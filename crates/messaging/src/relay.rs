//! Outbox relay.
//!
//! Polls the outbox for unpublished records and pushes them to the broker,
//! stamping `published_at` only after the broker accepts each message. A
//! crash between publish and stamp causes a benign republish, never a loss.
//!
//! Each shard owns a disjoint slice of the partition-key space and drains it
//! oldest-first, stopping at the first failure so that per-saga publish
//! order is preserved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::BackoffPolicy;
use store::{SagaStore, StoreError};

use crate::broker::MessageBroker;
use crate::Result;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Independent relay shards; each drains its own slice of the outbox.
    pub shards: usize,
    /// Max records fetched per shard per poll.
    pub batch_size: usize,
    /// Idle delay between polls.
    pub poll_interval: Duration,
    /// Backoff applied after a failed drain.
    pub backoff: BackoffPolicy,
    /// Published records older than this are deleted by the sweeper.
    pub retention: Duration,
    /// Delay between retention sweeps.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RelayConfig {
    /// Builds a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shards: std::env::var("RELAY_SHARDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.shards),
            batch_size: std::env::var("RELAY_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            poll_interval: std::env::var("RELAY_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            retention: std::env::var("RELAY_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            ..defaults
        }
    }
}

/// Moves committed outbox records to the broker, at least once.
pub struct OutboxRelay<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: SagaStore + 'static,
    B: MessageBroker + 'static,
{
    /// Creates a relay over the given store and broker.
    pub fn new(store: Arc<S>, broker: Arc<B>, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Drains one shard once: publish oldest-first, stamp after each accept.
    ///
    /// Stops at the first failure and returns it; the failed record and
    /// everything behind it stay unpublished so order within the shard
    /// holds.
    #[tracing::instrument(skip(self))]
    pub async fn drain_shard(&self, shard: usize) -> Result<usize> {
        let records = self
            .store
            .fetch_unpublished(shard, self.config.shards, self.config.batch_size)
            .await?;

        let mut published = 0;
        for record in records {
            let body = record.body().map_err(StoreError::from)?;
            self.broker.publish(&record.routing_key, body).await?;
            self.store.mark_published(record.event_id).await?;
            metrics::counter!("outbox_published_total").increment(1);
            published += 1;
        }

        if published > 0 {
            tracing::debug!(shard, published, "drained shard");
        }
        Ok(published)
    }

    /// Drains every shard once, returning the total published.
    ///
    /// A failing shard is logged and skipped; the others still drain.
    pub async fn drain_all(&self) -> usize {
        let mut total = 0;
        for shard in 0..self.config.shards {
            match self.drain_shard(shard).await {
                Ok(published) => total += published,
                Err(err) => {
                    tracing::warn!(shard, error = %err, "shard drain failed");
                }
            }
        }
        total
    }

    /// Deletes published records older than the retention window.
    pub async fn sweep_published(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let deleted = self.store.delete_published_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "swept published outbox records");
        }
        Ok(deleted)
    }

    /// Spawns one polling task per shard plus the retention sweeper.
    ///
    /// Tasks exit when `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.config.shards + 1);

        for shard in 0..self.config.shards {
            let relay = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut failures = 0u32;
                loop {
                    let delay = match relay.drain_shard(shard).await {
                        Ok(_) => {
                            failures = 0;
                            relay.config.poll_interval
                        }
                        Err(err) => {
                            failures += 1;
                            tracing::warn!(shard, failures, error = %err, "drain failed, backing off");
                            relay.config.backoff.delay(failures)
                        }
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        let relay = Arc::clone(&self);
        let mut shutdown = shutdown;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(relay.config.sweep_interval) => {
                        if let Err(err) = relay.sweep_published().await {
                            tracing::warn!(error = %err, "retention sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        tasks
    }
}
