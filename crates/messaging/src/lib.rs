//! The publish/consume reliability layer of the billing saga.
//!
//! The outbox relay guarantees at-least-once publication of committed
//! events; the inbox dispatcher makes at-least-once delivery look
//! exactly-once-effective to handlers and preserves per-saga order; the
//! dead-letter queue is the escalation path for everything that cannot be
//! processed.

mod broker;
mod dead_letter;
mod dispatcher;
mod error;
mod handler;
mod relay;

pub use broker::{Delivery, InMemoryBroker, MessageBroker};
pub use dead_letter::{DeadLetterQueue, DeadLetterReason, DeadLetterRecord};
pub use dispatcher::{DispatchOutcome, DispatcherConfig, InboxDispatcher};
pub use error::MessagingError;
pub use handler::{EventHandler, HandlerEffects, HandlerError};
pub use relay::{OutboxRelay, RelayConfig};

/// Convenience type alias for messaging results.
pub type Result<T> = std::result::Result<T, MessagingError>;
