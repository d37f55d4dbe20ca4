//! Persistence for the billing saga: saga state snapshots, the outbox, and
//! the inbox dedup ledger.
//!
//! Each service owns its own copy of these tables; cross-service visibility
//! happens only through envelopes. The single entry point for writes is
//! [`SagaStore::commit`], which applies a saga update, its outbox events and
//! an inbox record in one atomic scope.

mod error;
mod memory;
mod postgres;
mod record;
mod store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use record::{InboxRecord, OutboxRecord, StoredSaga};
pub use store::{SagaStore, SagaUpdate};

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
