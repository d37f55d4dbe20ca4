//! Collaborator contracts and in-memory fakes.

use std::sync::Mutex;

use async_trait::async_trait;
use common::{CustomerId, Money};
use envelope::LineItem;
use serde::{Deserialize, Serialize};

use crate::ClientError;

/// Request to the tax collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxRequest {
    pub jurisdiction: String,
    pub line_items: Vec<LineItem>,
}

impl TaxRequest {
    /// Returns the pre-tax amount the request covers.
    pub fn base_amount(&self) -> Money {
        self.line_items
            .iter()
            .fold(Money::zero(), |sum, item| sum + item.amount())
    }
}

/// Response from the tax collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxResponse {
    pub tax_amount: Money,
}

/// Request to the discount collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountRequest {
    pub customer_id: CustomerId,
    pub coupon_code: Option<String>,
    pub base_amount: Money,
}

/// Response from the discount collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountResponse {
    pub discount_amount: Money,
}

/// Computes tax for an invoice's line items.
#[async_trait]
pub trait TaxCollaborator: Send + Sync {
    async fn calculate_tax(&self, request: TaxRequest) -> Result<TaxResponse, ClientError>;
}

/// Resolves the discount for a customer and coupon.
#[async_trait]
pub trait DiscountCollaborator: Send + Sync {
    async fn apply_discount(
        &self,
        request: DiscountRequest,
    ) -> Result<DiscountResponse, ClientError>;
}

#[derive(Default)]
struct FakeState {
    calls: u32,
    transient_failures_remaining: u32,
    fail_permanently: bool,
}

impl FakeState {
    fn take_failure(&mut self) -> Option<ClientError> {
        self.calls += 1;
        if self.fail_permanently {
            return Some(ClientError::Permanent {
                status: Some(422),
                message: "rejected by collaborator".to_string(),
            });
        }
        if self.transient_failures_remaining > 0 {
            self.transient_failures_remaining -= 1;
            return Some(ClientError::Transient {
                message: "connection refused".to_string(),
            });
        }
        None
    }
}

/// In-memory tax collaborator: a flat rate in basis points.
pub struct InMemoryTaxService {
    rate_bps: i64,
    state: Mutex<FakeState>,
}

impl InMemoryTaxService {
    /// Creates a service charging the given rate, e.g. 800 for 8%.
    pub fn new(rate_bps: i64) -> Self {
        Self {
            rate_bps,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Makes the next `n` calls fail transiently.
    pub fn set_transient_failures(&self, n: u32) {
        self.state.lock().unwrap().transient_failures_remaining = n;
    }

    /// Makes every call fail permanently.
    pub fn set_permanent_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_permanently = fail;
    }

    /// Returns how many calls the service has received.
    pub fn call_count(&self) -> u32 {
        self.state.lock().unwrap().calls
    }
}

impl Default for InMemoryTaxService {
    /// An 8% tax service.
    fn default() -> Self {
        Self::new(800)
    }
}

#[async_trait]
impl TaxCollaborator for InMemoryTaxService {
    async fn calculate_tax(&self, request: TaxRequest) -> Result<TaxResponse, ClientError> {
        if let Some(err) = self.state.lock().unwrap().take_failure() {
            return Err(err);
        }
        let base = request.base_amount().as_cents();
        Ok(TaxResponse {
            tax_amount: Money::from_cents(base * self.rate_bps / 10_000),
        })
    }
}

/// In-memory discount collaborator: a flat percentage when a coupon is
/// present, nothing otherwise.
pub struct InMemoryDiscountService {
    percent: i64,
    state: Mutex<FakeState>,
}

impl InMemoryDiscountService {
    /// Creates a service granting the given percentage off for any coupon.
    pub fn new(percent: i64) -> Self {
        Self {
            percent,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Makes the next `n` calls fail transiently.
    pub fn set_transient_failures(&self, n: u32) {
        self.state.lock().unwrap().transient_failures_remaining = n;
    }

    /// Makes every call fail permanently.
    pub fn set_permanent_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_permanently = fail;
    }

    /// Returns how many calls the service has received.
    pub fn call_count(&self) -> u32 {
        self.state.lock().unwrap().calls
    }
}

impl Default for InMemoryDiscountService {
    /// A 10%-off-with-coupon discount service.
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl DiscountCollaborator for InMemoryDiscountService {
    async fn apply_discount(
        &self,
        request: DiscountRequest,
    ) -> Result<DiscountResponse, ClientError> {
        if let Some(err) = self.state.lock().unwrap().take_failure() {
            return Err(err);
        }
        let discount_amount = if request.coupon_code.is_some() {
            Money::from_cents(request.base_amount.as_cents() * self.percent / 100)
        } else {
            Money::zero()
        };
        Ok(DiscountResponse { discount_amount })
    }
}
