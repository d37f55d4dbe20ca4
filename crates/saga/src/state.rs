//! Invoice lifecycle states.

use serde::{Deserialize, Serialize};

/// Where an invoice is in its lifecycle.
///
/// Forward path: `Draft → TaxPending → DiscountPending → Finalized →
/// PaymentPending → Paid | PaymentFailed → Closed`. `Cancelled` is reachable
/// from any non-terminal state and `FailedPermanently` from the collaborator
/// steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    TaxPending,
    DiscountPending,
    Finalized,
    PaymentPending,
    Paid,
    PaymentFailed,
    Closed,
    Cancelled,
    FailedPermanently,
}

impl InvoiceStatus {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Closed | InvoiceStatus::Cancelled | InvoiceStatus::FailedPermanently
        )
    }

    /// True once a payment outcome has been durably applied.
    pub fn is_settled(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::PaymentFailed)
    }

    /// True once the invoice total has been computed and announced, meaning
    /// cancellation needs a compensating event.
    pub fn crossed_service_boundary(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Finalized
                | InvoiceStatus::PaymentPending
                | InvoiceStatus::Paid
                | InvoiceStatus::PaymentFailed
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::TaxPending => "tax_pending",
            InvoiceStatus::DiscountPending => "discount_pending",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::PaymentPending => "payment_pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::PaymentFailed => "payment_failed",
            InvoiceStatus::Closed => "closed",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::FailedPermanently => "failed_permanently",
        };
        write!(f, "{name}")
    }
}
