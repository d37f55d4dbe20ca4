//! Event types and their typed payloads.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money};
use serde::{Deserialize, Serialize};

/// The closed set of event types carried over the broker.
///
/// The string form doubles as the broker routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InvoiceCreated,
    TaxCalculated,
    DiscountApplied,
    PaymentReceived,
    PaymentFailed,
    InvoiceCancelled,
    InvoicePaymentFailed,
}

impl EventType {
    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InvoiceCreated => "invoice_created",
            EventType::TaxCalculated => "tax_calculated",
            EventType::DiscountApplied => "discount_applied",
            EventType::PaymentReceived => "payment_received",
            EventType::PaymentFailed => "payment_failed",
            EventType::InvoiceCancelled => "invoice_cancelled",
            EventType::InvoicePaymentFailed => "invoice_payment_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single invoice line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl LineItem {
    /// Creates a line item.
    pub fn new(description: impl Into<String>, quantity: u32, unit_price: Money) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns quantity times unit price.
    pub fn amount(&self) -> Money {
        Money::from_cents(self.unit_price.as_cents() * self.quantity as i64)
    }
}

/// Event-type-specific payload data, validated at decode time.
///
/// Serializes as two adjacent fields, `event_type` and `payload`, matching
/// the wire layout consumers bind routing keys against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    InvoiceCreated {
        invoice_id: CorrelationId,
        customer_id: CustomerId,
        line_items: Vec<LineItem>,
        base_amount: Money,
    },
    TaxCalculated {
        invoice_id: CorrelationId,
        jurisdiction: String,
        tax_amount: Money,
    },
    DiscountApplied {
        invoice_id: CorrelationId,
        coupon_code: Option<String>,
        discount_amount: Money,
    },
    PaymentReceived {
        invoice_id: CorrelationId,
        payment_id: String,
        amount: Money,
        received_at: DateTime<Utc>,
    },
    PaymentFailed {
        invoice_id: CorrelationId,
        payment_id: String,
        reason_code: String,
        failed_at: DateTime<Utc>,
    },
    InvoiceCancelled {
        invoice_id: CorrelationId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
    InvoicePaymentFailed {
        invoice_id: CorrelationId,
        payment_id: String,
        reason_code: String,
    },
}

impl EventPayload {
    /// Returns the event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::InvoiceCreated { .. } => EventType::InvoiceCreated,
            EventPayload::TaxCalculated { .. } => EventType::TaxCalculated,
            EventPayload::DiscountApplied { .. } => EventType::DiscountApplied,
            EventPayload::PaymentReceived { .. } => EventType::PaymentReceived,
            EventPayload::PaymentFailed { .. } => EventType::PaymentFailed,
            EventPayload::InvoiceCancelled { .. } => EventType::InvoiceCancelled,
            EventPayload::InvoicePaymentFailed { .. } => EventType::InvoicePaymentFailed,
        }
    }

    /// Returns the invoice id carried in the payload.
    pub fn invoice_id(&self) -> CorrelationId {
        match self {
            EventPayload::InvoiceCreated { invoice_id, .. }
            | EventPayload::TaxCalculated { invoice_id, .. }
            | EventPayload::DiscountApplied { invoice_id, .. }
            | EventPayload::PaymentReceived { invoice_id, .. }
            | EventPayload::PaymentFailed { invoice_id, .. }
            | EventPayload::InvoiceCancelled { invoice_id, .. }
            | EventPayload::InvoicePaymentFailed { invoice_id, .. } => *invoice_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::InvoiceCreated.as_str(), "invoice_created");
        assert_eq!(EventType::PaymentFailed.as_str(), "payment_failed");
        assert_eq!(
            serde_json::to_string(&EventType::PaymentReceived).unwrap(),
            "\"payment_received\""
        );
    }

    #[test]
    fn payload_tags_match_event_type() {
        let payload = EventPayload::DiscountApplied {
            invoice_id: CorrelationId::new(),
            coupon_code: Some("SAVE10".to_string()),
            discount_amount: Money::from_cents(1_000),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event_type"], "discount_applied");
        assert_eq!(json["payload"]["coupon_code"], "SAVE10");
        assert_eq!(payload.event_type(), EventType::DiscountApplied);
    }

    #[test]
    fn line_item_amount() {
        let item = LineItem::new("Widget", 3, Money::from_cents(250));
        assert_eq!(item.amount(), Money::from_cents(750));
    }

    #[test]
    fn invoice_id_extraction() {
        let id = CorrelationId::new();
        let payload = EventPayload::PaymentReceived {
            invoice_id: id,
            payment_id: "PAY-1".to_string(),
            amount: Money::from_cents(9_800),
            received_at: Utc::now(),
        };
        assert_eq!(payload.invoice_id(), id);
    }
}
