//! Inbound payment event handlers.

use std::sync::Arc;

use async_trait::async_trait;
use envelope::{Envelope, EventPayload};
use messaging::{EventHandler, HandlerEffects, HandlerError};
use store::{OutboxRecord, SagaStore};

use crate::error::SagaError;
use crate::invoice::InvoiceSaga;

/// Service name stamped on compensating events this handler emits.
const SOURCE_SERVICE: &str = "invoice-service";

/// Settles invoices from `payment_received` / `payment_failed` events.
///
/// The dispatcher owns dedup and the commit; this handler only loads the
/// saga, applies the transition, and hands back the effects.
pub struct PaymentEventHandler<S> {
    store: Arc<S>,
}

impl<S: SagaStore> PaymentEventHandler<S> {
    /// Creates a handler over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn load_saga(&self, envelope: &Envelope) -> Result<InvoiceSaga, HandlerError> {
        let stored = self
            .store
            .load_saga(envelope.correlation_id)
            .await
            .map_err(|err| HandlerError::Transient(err.to_string()))?
            // Payment events can outrun the saga's own commits; give the
            // forward path time before dead-lettering.
            .ok_or_else(|| {
                HandlerError::Transient(format!(
                    "no saga for correlation id {}",
                    envelope.correlation_id
                ))
            })?;
        InvoiceSaga::from_stored(&stored).map_err(|err| HandlerError::Permanent(err.to_string()))
    }
}

fn transition_error(err: SagaError) -> HandlerError {
    match err {
        SagaError::ConflictingTransition { .. } => {
            HandlerError::ConflictingTransition(err.to_string())
        }
        SagaError::Store(inner) => HandlerError::Transient(inner.to_string()),
        other => HandlerError::Permanent(other.to_string()),
    }
}

#[async_trait]
impl<S: SagaStore> EventHandler for PaymentEventHandler<S> {
    fn routing_keys(&self) -> Vec<&'static str> {
        vec!["payment_received", "payment_failed"]
    }

    #[tracing::instrument(skip_all, fields(correlation_id = %envelope.correlation_id))]
    async fn handle(&self, envelope: &Envelope) -> Result<HandlerEffects, HandlerError> {
        let mut saga = self.load_saga(envelope).await?;
        let expected = saga.version;

        match &envelope.payload {
            EventPayload::PaymentReceived { payment_id, .. } => {
                saga.apply_payment_received(envelope.event_id, payment_id.clone())
                    .map_err(transition_error)?;
                tracing::info!(payment_id = %payment_id, "invoice paid");
                let snapshot = saga
                    .to_stored()
                    .map_err(|err| HandlerError::Permanent(err.to_string()))?;
                Ok(HandlerEffects::saga(snapshot, expected))
            }
            EventPayload::PaymentFailed {
                payment_id,
                reason_code,
                ..
            } => {
                saga.apply_payment_failed(envelope.event_id, payment_id.clone(), reason_code.clone())
                    .map_err(transition_error)?;
                tracing::warn!(payment_id = %payment_id, reason_code = %reason_code, "payment failed");

                // Compensating event for downstream listeners.
                let compensation = Envelope::new(
                    SOURCE_SERVICE,
                    saga.invoice_id,
                    EventPayload::InvoicePaymentFailed {
                        invoice_id: saga.invoice_id,
                        payment_id: payment_id.clone(),
                        reason_code: reason_code.clone(),
                    },
                );
                let record = OutboxRecord::for_envelope(&compensation)
                    .map_err(|err| HandlerError::Permanent(err.to_string()))?;
                let snapshot = saga
                    .to_stored()
                    .map_err(|err| HandlerError::Permanent(err.to_string()))?;
                Ok(HandlerEffects::saga(snapshot, expected).with_outbox(record))
            }
            other => {
                tracing::warn!(event_type = other.event_type().as_str(), "unexpected event type");
                Ok(HandlerEffects::none())
            }
        }
    }
}
