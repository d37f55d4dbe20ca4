//! Shared types used across the billing saga crates.

mod backoff;
mod money;
mod partition;
mod types;

pub use backoff::BackoffPolicy;
pub use money::Money;
pub use partition::partition_for;
pub use types::{CorrelationId, CustomerId, EventId, Version};
