use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId, Version};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::record::{OutboxRecord, StoredSaga};
use crate::store::{SagaStore, SagaUpdate};
use crate::{Result, StoreError};

/// Schema for the three service-private tables. Applied with IF NOT EXISTS
/// so bootstrap is idempotent across replicas of the same service.
///
/// `outbox.seq` breaks `created_at` ties: TIMESTAMPTZ keeps microseconds, so
/// two records from one commit can carry the same timestamp.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS billing_sagas (
    correlation_id UUID PRIMARY KEY,
    state JSONB NOT NULL,
    version BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    event_id UUID PRIMARY KEY,
    aggregate_id UUID NOT NULL,
    routing_key TEXT NOT NULL,
    payload JSONB NOT NULL,
    partition_key BIGINT NOT NULL,
    seq BIGINT NOT NULL GENERATED ALWAYS AS IDENTITY,
    created_at TIMESTAMPTZ NOT NULL,
    published_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS outbox_unpublished_idx
    ON outbox (partition_key, created_at, seq)
    WHERE published_at IS NULL;

CREATE TABLE IF NOT EXISTS inbox (
    event_id UUID NOT NULL,
    consumer TEXT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (event_id, consumer)
);
"#;

/// PostgreSQL-backed store implementation.
///
/// One `SagaUpdate` maps to one database transaction; read-committed
/// isolation is sufficient because the saga upsert is a conditional update
/// on the version column and the inbox insert is guarded by its primary key.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            partition_key: row.try_get("partition_key")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresStore {
    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<StoredSaga>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT correlation_id, state, version, updated_at
            FROM billing_sagas
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(StoredSaga {
                correlation_id: CorrelationId::from_uuid(
                    row.try_get::<Uuid, _>("correlation_id")?,
                ),
                state: row.try_get("state")?,
                version: Version::new(row.try_get("version")?),
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn commit(&self, update: SagaUpdate) -> Result<Version> {
        let mut tx = self.pool.begin().await?;

        let mut version = update
            .saga
            .as_ref()
            .map(|(_, expected)| *expected)
            .unwrap_or(Version::initial());

        if let Some((saga, expected)) = &update.saga {
            let rows = if *expected == Version::initial() {
                sqlx::query(
                    r#"
                    INSERT INTO billing_sagas (correlation_id, state, version, updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (correlation_id) DO NOTHING
                    "#,
                )
                .bind(saga.correlation_id.as_uuid())
                .bind(&saga.state)
                .bind(saga.version.as_i64())
                .bind(saga.updated_at)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            } else {
                sqlx::query(
                    r#"
                    UPDATE billing_sagas
                    SET state = $2, version = $3, updated_at = $4
                    WHERE correlation_id = $1 AND version = $5
                    "#,
                )
                .bind(saga.correlation_id.as_uuid())
                .bind(&saga.state)
                .bind(saga.version.as_i64())
                .bind(saga.updated_at)
                .bind(expected.as_i64())
                .execute(&mut *tx)
                .await?
                .rows_affected()
            };

            if rows == 0 {
                let actual: Option<i64> = sqlx::query_scalar(
                    "SELECT version FROM billing_sagas WHERE correlation_id = $1",
                )
                .bind(saga.correlation_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

                return Err(StoreError::ConcurrencyConflict {
                    correlation_id: saga.correlation_id,
                    expected: *expected,
                    actual: Version::new(actual.unwrap_or(0)),
                });
            }

            version = saga.version;
        }

        for record in &update.outbox {
            sqlx::query(
                r#"
                INSERT INTO outbox
                    (event_id, aggregate_id, routing_key, payload, partition_key, created_at, published_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.event_id.as_uuid())
            .bind(record.aggregate_id.as_uuid())
            .bind(&record.routing_key)
            .bind(&record.payload)
            .bind(record.partition_key)
            .bind(record.created_at)
            .bind(record.published_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(inbox) = &update.inbox {
            let rows = sqlx::query(
                r#"
                INSERT INTO inbox (event_id, consumer, processed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id, consumer) DO NOTHING
                "#,
            )
            .bind(inbox.event_id.as_uuid())
            .bind(&inbox.consumer)
            .bind(inbox.processed_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            // A concurrent replica won the race; dropping the transaction
            // rolls back the saga and outbox writes with it.
            if rows == 0 {
                return Err(StoreError::DuplicateEvent {
                    event_id: inbox.event_id,
                });
            }
        }

        tx.commit().await?;
        Ok(version)
    }

    async fn is_processed(&self, event_id: EventId, consumer: &str) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM inbox WHERE event_id = $1 AND consumer = $2",
        )
        .bind(event_id.as_uuid())
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await?;

        Ok(exists.is_some())
    }

    async fn fetch_unpublished(
        &self,
        shard: usize,
        shard_count: usize,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, routing_key, payload, partition_key, created_at, published_at
            FROM outbox
            WHERE published_at IS NULL AND partition_key % $1 = $2
            ORDER BY created_at ASC, seq ASC
            LIMIT $3
            "#,
        )
        .bind(shard_count as i64)
        .bind(shard as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET published_at = NOW() WHERE event_id = $1 AND published_at IS NULL",
        )
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
