//! Invoice lifecycle saga.
//!
//! Coordinates tax, discount, invoice, and payment concerns for one invoice:
//! synchronous collaborator calls on the forward path, asynchronous payment
//! events on the settlement path, optimistic concurrency everywhere a race
//! is possible.

mod error;
mod handlers;
mod invoice;
mod orchestrator;
mod state;

pub use error::SagaError;
pub use handlers::PaymentEventHandler;
pub use invoice::InvoiceSaga;
pub use orchestrator::{CreateInvoice, SagaOrchestrator};
pub use state::InvoiceStatus;

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
