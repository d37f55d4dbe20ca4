//! Synchronous collaborator clients.
//!
//! Tax and discount lookups happen inline during invoice finalization, so
//! every call goes through a facade that adds a per-attempt timeout, bounded
//! retries with jittered backoff, and a circuit breaker per collaborator.
//! Only transient failures advance the breaker; a collaborator that answers
//! with a client error is up, just unhappy.

mod breaker;
mod collaborator;
mod error;
mod facade;
mod http;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use collaborator::{
    DiscountCollaborator, DiscountRequest, DiscountResponse, InMemoryDiscountService,
    InMemoryTaxService, TaxCollaborator, TaxRequest, TaxResponse,
};
pub use error::ClientError;
pub use facade::{ClientFacade, FacadeConfig};
pub use http::{HttpDiscountClient, HttpTaxClient};

/// Convenience type alias for client results.
pub type Result<T> = std::result::Result<T, ClientError>;
