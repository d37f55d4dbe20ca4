//! Saga orchestrator: drives an invoice from creation to settlement.

use std::sync::Arc;

use clients::{
    ClientFacade, DiscountCollaborator, DiscountRequest, FacadeConfig, TaxCollaborator, TaxRequest,
};
use common::{CorrelationId, CustomerId, Version};
use envelope::{Envelope, EventPayload, LineItem};
use store::{OutboxRecord, SagaStore, SagaUpdate, StoreError};

use crate::error::SagaError;
use crate::invoice::InvoiceSaga;
use crate::Result;

/// Service name stamped on every envelope this orchestrator emits.
const SOURCE_SERVICE: &str = "invoice-service";

/// Attempts to reapply an operation after losing an optimistic-concurrency
/// race before giving up.
const CONFLICT_RETRIES: u32 = 3;

/// Request to start an invoice saga.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub invoice_id: CorrelationId,
    pub customer_id: CustomerId,
    pub jurisdiction: String,
    pub coupon_code: Option<String>,
    pub line_items: Vec<LineItem>,
}

/// Owns the forward path of the invoice lifecycle.
///
/// Collaborator calls go through one facade per collaborator; every state
/// change commits through the store together with the events it must
/// announce, so an event is never published for a change that rolled back.
pub struct SagaOrchestrator<S, T, D> {
    store: Arc<S>,
    tax: Arc<T>,
    discount: Arc<D>,
    tax_facade: ClientFacade,
    discount_facade: ClientFacade,
}

impl<S, T, D> SagaOrchestrator<S, T, D>
where
    S: SagaStore,
    T: TaxCollaborator,
    D: DiscountCollaborator,
{
    /// Creates an orchestrator; both collaborator facades share the config.
    pub fn new(store: Arc<S>, tax: Arc<T>, discount: Arc<D>, facade: FacadeConfig) -> Self {
        Self {
            store,
            tax,
            discount,
            tax_facade: ClientFacade::new("tax-service", facade.clone()),
            discount_facade: ClientFacade::new("discount-service", facade),
        }
    }

    /// Starts a saga and drives it to `PaymentPending`, or to
    /// `FailedPermanently` when a collaborator is unreachable.
    ///
    /// A collaborator failure is not an `Err`: the saga lands in a terminal
    /// state that is visible to operators, and that saga is returned.
    #[tracing::instrument(skip_all, fields(correlation_id = %request.invoice_id))]
    pub async fn start(&self, request: CreateInvoice) -> Result<InvoiceSaga> {
        let mut saga = InvoiceSaga::new(
            request.invoice_id,
            request.customer_id,
            request.jurisdiction,
            request.coupon_code,
            request.line_items,
        );
        let expected = saga.version;
        saga.begin_tax()?;
        self.persist(&saga, expected, vec![]).await?;
        metrics::counter!("sagas_started_total").increment(1);

        let tax_request = TaxRequest {
            jurisdiction: saga.jurisdiction.clone(),
            line_items: saga.line_items.clone(),
        };
        let tax = match self
            .tax_facade
            .call(|| self.tax.calculate_tax(tax_request.clone()))
            .await
        {
            Ok(response) => response.tax_amount,
            Err(err) => return self.fail(saga, err.to_string()).await,
        };
        let expected = saga.version;
        saga.record_tax(tax)?;
        let tax_event = self.envelope_for(
            &saga,
            EventPayload::TaxCalculated {
                invoice_id: saga.invoice_id,
                jurisdiction: saga.jurisdiction.clone(),
                tax_amount: tax,
            },
        )?;
        self.persist(&saga, expected, vec![tax_event]).await?;

        let discount_request = DiscountRequest {
            customer_id: saga.customer_id,
            coupon_code: saga.coupon_code.clone(),
            base_amount: saga.base_amount,
        };
        let discount = match self
            .discount_facade
            .call(|| self.discount.apply_discount(discount_request.clone()))
            .await
        {
            Ok(response) => response.discount_amount,
            Err(err) => return self.fail(saga, err.to_string()).await,
        };
        let expected = saga.version;
        saga.record_discount(discount)?;
        // Finalization announces the invoice in the same commit that writes
        // the Finalized snapshot.
        let discount_event = self.envelope_for(
            &saga,
            EventPayload::DiscountApplied {
                invoice_id: saga.invoice_id,
                coupon_code: saga.coupon_code.clone(),
                discount_amount: discount,
            },
        )?;
        let created_event = self.envelope_for(
            &saga,
            EventPayload::InvoiceCreated {
                invoice_id: saga.invoice_id,
                customer_id: saga.customer_id,
                line_items: saga.line_items.clone(),
                base_amount: saga.base_amount,
            },
        )?;
        self.persist(&saga, expected, vec![discount_event, created_event])
            .await?;

        let expected = saga.version;
        saga.mark_payment_pending()?;
        self.persist(&saga, expected, vec![]).await?;

        tracing::info!(total = %saga.total.unwrap_or_default(), "invoice awaiting payment");
        Ok(saga)
    }

    /// Cancels a saga, emitting a compensating `invoice_cancelled` event
    /// when the invoice has already been announced to other services.
    ///
    /// Loses against concurrent forward transitions and re-evaluates, so a
    /// cancellation racing a payment settles on whichever committed first.
    #[tracing::instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub async fn cancel(
        &self,
        correlation_id: CorrelationId,
        reason: &str,
    ) -> Result<InvoiceSaga> {
        let mut attempt = 0;
        loop {
            let mut saga = self.load_required(correlation_id).await?;
            let expected = saga.version;
            let announced = saga.status.crossed_service_boundary();
            saga.cancel(reason)?;

            let outbox = if announced {
                vec![self.envelope_for(
                    &saga,
                    EventPayload::InvoiceCancelled {
                        invoice_id: saga.invoice_id,
                        reason: reason.to_string(),
                        cancelled_at: chrono::Utc::now(),
                    },
                )?]
            } else {
                vec![]
            };

            match self.persist(&saga, expected, outbox).await {
                Ok(()) => {
                    metrics::counter!("sagas_cancelled_total").increment(1);
                    return Ok(saga);
                }
                Err(SagaError::Store(StoreError::ConcurrencyConflict { .. }))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(attempt, "cancellation lost a version race, re-evaluating");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Administratively closes a paid invoice.
    #[tracing::instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub async fn close(&self, correlation_id: CorrelationId) -> Result<InvoiceSaga> {
        let mut attempt = 0;
        loop {
            let mut saga = self.load_required(correlation_id).await?;
            let expected = saga.version;
            saga.close()?;
            match self.persist(&saga, expected, vec![]).await {
                Ok(()) => return Ok(saga),
                Err(SagaError::Store(StoreError::ConcurrencyConflict { .. }))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Loads a saga, if one exists.
    pub async fn load(&self, correlation_id: CorrelationId) -> Result<Option<InvoiceSaga>> {
        match self.store.load_saga(correlation_id).await? {
            Some(stored) => Ok(Some(InvoiceSaga::from_stored(&stored)?)),
            None => Ok(None),
        }
    }

    async fn load_required(&self, correlation_id: CorrelationId) -> Result<InvoiceSaga> {
        self.load(correlation_id)
            .await?
            .ok_or(SagaError::NotFound(correlation_id))
    }

    async fn fail(&self, mut saga: InvoiceSaga, reason: String) -> Result<InvoiceSaga> {
        tracing::error!(
            correlation_id = %saga.invoice_id,
            %reason,
            "collaborator unavailable, failing saga"
        );
        metrics::counter!("sagas_failed_total").increment(1);
        let expected = saga.version;
        saga.fail_permanently(reason)?;
        self.persist(&saga, expected, vec![]).await?;
        Ok(saga)
    }

    fn envelope_for(&self, saga: &InvoiceSaga, payload: EventPayload) -> Result<OutboxRecord> {
        let envelope = Envelope::new(SOURCE_SERVICE, saga.invoice_id, payload);
        Ok(OutboxRecord::for_envelope(&envelope)?)
    }

    async fn persist(
        &self,
        saga: &InvoiceSaga,
        expected: Version,
        outbox: Vec<OutboxRecord>,
    ) -> Result<()> {
        let mut update = SagaUpdate::saga(saga.to_stored()?, expected);
        for record in outbox {
            update = update.with_outbox(record);
        }
        self.store.commit(update).await?;
        Ok(())
    }
}
