//! The invoice saga aggregate.
//!
//! Pure state machine: every method either applies a legal transition and
//! bumps the optimistic-concurrency version, or returns an error and leaves
//! the aggregate untouched. Persistence and event emission live in the
//! orchestrator and handlers.

use common::{CorrelationId, CustomerId, EventId, Money, Version};
use envelope::LineItem;
use serde::{Deserialize, Serialize};
use store::StoredSaga;

use crate::error::SagaError;
use crate::state::InvoiceStatus;

/// One invoice's saga state, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSaga {
    pub invoice_id: CorrelationId,
    pub customer_id: CustomerId,
    pub jurisdiction: String,
    pub coupon_code: Option<String>,
    pub line_items: Vec<LineItem>,
    pub base_amount: Money,
    pub status: InvoiceStatus,
    pub tax_amount: Option<Money>,
    pub discount_amount: Option<Money>,
    pub total: Option<Money>,
    pub payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub version: Version,
    /// The inbound event that caused the most recent transition, if any.
    pub last_event_id: Option<EventId>,
}

impl InvoiceSaga {
    /// Creates a draft invoice. The base amount is the sum of the line
    /// items.
    pub fn new(
        invoice_id: CorrelationId,
        customer_id: CustomerId,
        jurisdiction: impl Into<String>,
        coupon_code: Option<String>,
        line_items: Vec<LineItem>,
    ) -> Self {
        let base_amount = line_items
            .iter()
            .fold(Money::zero(), |sum, item| sum + item.amount());
        Self {
            invoice_id,
            customer_id,
            jurisdiction: jurisdiction.into(),
            coupon_code,
            line_items,
            base_amount,
            status: InvoiceStatus::Draft,
            tax_amount: None,
            discount_amount: None,
            total: None,
            payment_id: None,
            failure_reason: None,
            cancellation_reason: None,
            version: Version::initial(),
            last_event_id: None,
        }
    }

    fn advance(&mut self, status: InvoiceStatus) {
        self.status = status;
        self.version = self.version.next();
    }

    fn require(&self, expected: InvoiceStatus, action: &'static str) -> Result<(), SagaError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(SagaError::InvalidTransition {
                status: self.status,
                action,
            })
        }
    }

    /// `Draft → TaxPending`: the tax collaborator call is being issued.
    pub fn begin_tax(&mut self) -> Result<(), SagaError> {
        self.require(InvoiceStatus::Draft, "begin tax calculation for")?;
        self.advance(InvoiceStatus::TaxPending);
        Ok(())
    }

    /// `TaxPending → DiscountPending`: tax result received.
    pub fn record_tax(&mut self, tax_amount: Money) -> Result<(), SagaError> {
        self.require(InvoiceStatus::TaxPending, "record tax for")?;
        self.tax_amount = Some(tax_amount);
        self.advance(InvoiceStatus::DiscountPending);
        Ok(())
    }

    /// `DiscountPending → Finalized`: discount received, total computed as
    /// `base - discount + tax`.
    pub fn record_discount(&mut self, discount_amount: Money) -> Result<(), SagaError> {
        self.require(InvoiceStatus::DiscountPending, "record discount for")?;
        let tax = self.tax_amount.unwrap_or_else(Money::zero);
        self.discount_amount = Some(discount_amount);
        self.total = Some(self.base_amount - discount_amount + tax);
        self.advance(InvoiceStatus::Finalized);
        Ok(())
    }

    /// `Finalized → PaymentPending`: the totals have been announced; the
    /// saga now waits on a payment event.
    pub fn mark_payment_pending(&mut self) -> Result<(), SagaError> {
        self.require(InvoiceStatus::Finalized, "await payment for")?;
        self.advance(InvoiceStatus::PaymentPending);
        Ok(())
    }

    /// `PaymentPending → Paid`, driven by a `payment_received` event.
    ///
    /// A second settlement attempt after either outcome is a conflict, not
    /// an overwrite: first durably applied wins.
    pub fn apply_payment_received(
        &mut self,
        event_id: EventId,
        payment_id: impl Into<String>,
    ) -> Result<(), SagaError> {
        if self.status.is_settled() {
            return Err(SagaError::ConflictingTransition {
                status: self.status,
                attempted: "payment_received",
            });
        }
        self.require(InvoiceStatus::PaymentPending, "apply a payment to")?;
        self.payment_id = Some(payment_id.into());
        self.last_event_id = Some(event_id);
        self.advance(InvoiceStatus::Paid);
        Ok(())
    }

    /// `PaymentPending → PaymentFailed`, driven by a `payment_failed` event.
    pub fn apply_payment_failed(
        &mut self,
        event_id: EventId,
        payment_id: impl Into<String>,
        reason_code: impl Into<String>,
    ) -> Result<(), SagaError> {
        if self.status.is_settled() {
            return Err(SagaError::ConflictingTransition {
                status: self.status,
                attempted: "payment_failed",
            });
        }
        self.require(InvoiceStatus::PaymentPending, "fail a payment on")?;
        self.payment_id = Some(payment_id.into());
        self.failure_reason = Some(reason_code.into());
        self.last_event_id = Some(event_id);
        self.advance(InvoiceStatus::PaymentFailed);
        Ok(())
    }

    /// `Paid | PaymentFailed → Closed`: administrative finalization.
    pub fn close(&mut self) -> Result<(), SagaError> {
        if !self.status.is_settled() {
            return Err(SagaError::InvalidTransition {
                status: self.status,
                action: "close",
            });
        }
        self.advance(InvoiceStatus::Closed);
        Ok(())
    }

    /// `any non-terminal → Cancelled`.
    ///
    /// A paid invoice cannot be cancelled; that needs a refund workflow.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), SagaError> {
        if self.status == InvoiceStatus::Paid {
            return Err(SagaError::CancellationRejected {
                status: self.status,
            });
        }
        if self.status.is_terminal() {
            return Err(SagaError::InvalidTransition {
                status: self.status,
                action: "cancel",
            });
        }
        self.cancellation_reason = Some(reason.into());
        self.advance(InvoiceStatus::Cancelled);
        Ok(())
    }

    /// `TaxPending | DiscountPending → FailedPermanently`: a collaborator
    /// call exhausted its retry budget or hit an open circuit.
    pub fn fail_permanently(&mut self, reason: impl Into<String>) -> Result<(), SagaError> {
        if !matches!(
            self.status,
            InvoiceStatus::TaxPending | InvoiceStatus::DiscountPending
        ) {
            return Err(SagaError::InvalidTransition {
                status: self.status,
                action: "permanently fail",
            });
        }
        self.failure_reason = Some(reason.into());
        self.advance(InvoiceStatus::FailedPermanently);
        Ok(())
    }

    /// Serializes the aggregate into a storable snapshot.
    pub fn to_stored(&self) -> Result<StoredSaga, SagaError> {
        Ok(StoredSaga::new(
            self.invoice_id,
            serde_json::to_value(self)?,
            self.version,
        ))
    }

    /// Restores the aggregate from a stored snapshot.
    pub fn from_stored(stored: &StoredSaga) -> Result<Self, SagaError> {
        Ok(serde_json::from_value(stored.state.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> InvoiceSaga {
        InvoiceSaga::new(
            CorrelationId::new(),
            CustomerId::new(),
            "CA",
            Some("SAVE10".to_string()),
            vec![LineItem::new("Consulting", 4, Money::from_cents(2_500))],
        )
    }

    fn payment_pending() -> InvoiceSaga {
        let mut saga = draft();
        saga.begin_tax().unwrap();
        saga.record_tax(Money::from_cents(800)).unwrap();
        saga.record_discount(Money::from_cents(1_000)).unwrap();
        saga.mark_payment_pending().unwrap();
        saga
    }

    #[test]
    fn happy_path_computes_total_and_versions() {
        let mut saga = draft();
        assert_eq!(saga.base_amount, Money::from_cents(10_000));
        assert_eq!(saga.version, Version::initial());

        saga.begin_tax().unwrap();
        saga.record_tax(Money::from_cents(800)).unwrap();
        saga.record_discount(Money::from_cents(1_000)).unwrap();
        // 100.00 - 10.00 + 8.00
        assert_eq!(saga.total, Some(Money::from_cents(9_800)));
        assert_eq!(saga.status, InvoiceStatus::Finalized);
        assert_eq!(saga.version, Version::new(3));

        saga.mark_payment_pending().unwrap();
        saga.apply_payment_received(EventId::new(), "PAY-1").unwrap();
        assert_eq!(saga.status, InvoiceStatus::Paid);
        saga.close().unwrap();
        assert_eq!(saga.status, InvoiceStatus::Closed);
        assert_eq!(saga.version, Version::new(6));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut saga = draft();
        assert!(matches!(
            saga.record_tax(Money::from_cents(800)),
            Err(SagaError::InvalidTransition { .. })
        ));
        assert!(matches!(
            saga.apply_payment_received(EventId::new(), "PAY-1"),
            Err(SagaError::InvalidTransition { .. })
        ));
        // Nothing changed.
        assert_eq!(saga.status, InvoiceStatus::Draft);
        assert_eq!(saga.version, Version::initial());
    }

    #[test]
    fn first_settlement_wins() {
        let mut saga = payment_pending();
        saga.apply_payment_received(EventId::new(), "PAY-1").unwrap();

        let err = saga
            .apply_payment_failed(EventId::new(), "PAY-2", "card_declined")
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::ConflictingTransition {
                status: InvoiceStatus::Paid,
                attempted: "payment_failed",
            }
        ));
        assert_eq!(saga.status, InvoiceStatus::Paid);
    }

    #[test]
    fn failed_then_received_is_also_a_conflict() {
        let mut saga = payment_pending();
        saga.apply_payment_failed(EventId::new(), "PAY-1", "card_declined")
            .unwrap();
        assert!(matches!(
            saga.apply_payment_received(EventId::new(), "PAY-2"),
            Err(SagaError::ConflictingTransition { .. })
        ));
        assert_eq!(saga.status, InvoiceStatus::PaymentFailed);
        assert_eq!(saga.failure_reason.as_deref(), Some("card_declined"));
    }

    #[test]
    fn cancellation_rules() {
        // Pre-finalization cancel is a plain transition.
        let mut saga = draft();
        saga.cancel("customer request").unwrap();
        assert_eq!(saga.status, InvoiceStatus::Cancelled);

        // A failed payment can still be cancelled.
        let mut saga = payment_pending();
        saga.apply_payment_failed(EventId::new(), "PAY-1", "card_declined")
            .unwrap();
        saga.cancel("gave up").unwrap();
        assert_eq!(saga.status, InvoiceStatus::Cancelled);

        // Paid invoices are refund territory.
        let mut saga = payment_pending();
        saga.apply_payment_received(EventId::new(), "PAY-1").unwrap();
        assert!(matches!(
            saga.cancel("too late"),
            Err(SagaError::CancellationRejected { .. })
        ));

        // Terminal states stay terminal.
        let mut saga = draft();
        saga.cancel("first").unwrap();
        assert!(saga.cancel("second").is_err());
    }

    #[test]
    fn failed_payments_can_still_be_closed() {
        let mut saga = payment_pending();
        saga.apply_payment_failed(EventId::new(), "PAY-1", "card_declined")
            .unwrap();
        saga.close().unwrap();
        assert_eq!(saga.status, InvoiceStatus::Closed);

        let mut saga = payment_pending();
        assert!(saga.close().is_err());
    }

    #[test]
    fn fail_permanently_only_from_collaborator_steps() {
        let mut saga = draft();
        saga.begin_tax().unwrap();
        saga.fail_permanently("tax-service unavailable after 3 attempts")
            .unwrap();
        assert_eq!(saga.status, InvoiceStatus::FailedPermanently);

        let mut saga = payment_pending();
        assert!(saga.fail_permanently("nope").is_err());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut saga = payment_pending();
        saga.apply_payment_received(EventId::new(), "PAY-1").unwrap();

        let stored = saga.to_stored().unwrap();
        assert_eq!(stored.version, saga.version);
        let restored = InvoiceSaga::from_stored(&stored).unwrap();
        assert_eq!(restored, saga);
    }
}
