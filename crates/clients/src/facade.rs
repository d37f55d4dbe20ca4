//! Call facade: timeout, bounded retries, circuit breaking.

use std::future::Future;
use std::time::Duration;

use common::BackoffPolicy;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::ClientError;

/// Facade tuning knobs.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    /// Total attempts per call, including the first.
    pub attempts: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub breaker: BreakerConfig,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(2), 0.2),
            breaker: BreakerConfig::default(),
        }
    }
}

impl FacadeConfig {
    /// Builds a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            attempts: std::env::var("CLIENT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.attempts),
            timeout: std::env::var("CLIENT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            ..defaults
        }
    }
}

/// Wraps calls to one collaborator.
///
/// Transient failures and timeouts are retried with jittered backoff and
/// advance the breaker; permanent failures return immediately and leave the
/// breaker alone. Once the breaker opens, calls fail fast until the cooldown
/// lets a probe through.
pub struct ClientFacade {
    collaborator: String,
    config: FacadeConfig,
    breaker: CircuitBreaker,
}

impl ClientFacade {
    /// Creates a facade for the named collaborator.
    pub fn new(collaborator: impl Into<String>, config: FacadeConfig) -> Self {
        let collaborator = collaborator.into();
        let breaker = CircuitBreaker::new(collaborator.clone(), config.breaker);
        Self {
            collaborator,
            config,
            breaker,
        }
    }

    /// Runs `op` through the timeout/retry/breaker pipeline.
    #[tracing::instrument(skip_all, fields(collaborator = %self.collaborator))]
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last = String::new();
        for attempt in 1..=self.config.attempts {
            self.breaker.check()?;

            let outcome = match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Transient {
                    message: format!("timed out after {:?}", self.config.timeout),
                }),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    metrics::counter!("collaborator_calls_total").increment(1);
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(attempt, error = %err, "transient collaborator failure");
                    metrics::counter!("collaborator_transient_failures_total").increment(1);
                    self.breaker.record_failure();
                    last = err.to_string();
                }
                Err(err) => return Err(err),
            }

            if attempt < self.config.attempts {
                tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            }
        }

        Err(ClientError::RetriesExhausted {
            collaborator: self.collaborator.clone(),
            attempts: self.config.attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use common::Money;
    use envelope::LineItem;

    use super::*;
    use crate::collaborator::{InMemoryTaxService, TaxCollaborator, TaxRequest};

    fn fast_config() -> FacadeConfig {
        FacadeConfig {
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 0.0),
            ..FacadeConfig::default()
        }
    }

    fn tax_request() -> TaxRequest {
        TaxRequest {
            jurisdiction: "CA".to_string(),
            line_items: vec![LineItem::new("Widget", 1, Money::from_cents(10_000))],
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let service = InMemoryTaxService::default();
        service.set_transient_failures(2);
        let facade = ClientFacade::new("tax-service", fast_config());

        let response = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap();
        assert_eq!(response.tax_amount, Money::from_cents(800));
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let service = InMemoryTaxService::default();
        service.set_permanent_failure(true);
        let facade = ClientFacade::new("tax-service", fast_config());

        let err = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Permanent { status: Some(422), .. }));
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_error() {
        let service = InMemoryTaxService::default();
        service.set_transient_failures(10);
        let facade = ClientFacade::new("tax-service", fast_config());

        let err = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast() {
        let service = InMemoryTaxService::default();
        service.set_transient_failures(100);
        let facade = ClientFacade::new(
            "tax-service",
            FacadeConfig {
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    cooldown: Duration::from_secs(60),
                },
                ..fast_config()
            },
        );

        // Two calls of three attempts each: the fifth failure opens the
        // breaker mid-call.
        assert!(facade.call(|| service.calculate_tax(tax_request())).await.is_err());
        let err = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { .. }));
        assert_eq!(service.call_count(), 5);

        // Fast-fail: the collaborator is not called while open.
        let err = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { .. }));
        assert_eq!(service.call_count(), 5);
    }

    #[tokio::test]
    async fn half_open_probe_recovers() {
        let service = InMemoryTaxService::default();
        service.set_transient_failures(2);
        let facade = ClientFacade::new(
            "tax-service",
            FacadeConfig {
                attempts: 1,
                breaker: BreakerConfig {
                    failure_threshold: 2,
                    cooldown: Duration::from_millis(0),
                },
                ..fast_config()
            },
        );

        assert!(facade.call(|| service.calculate_tax(tax_request())).await.is_err());
        assert!(facade.call(|| service.calculate_tax(tax_request())).await.is_err());
        // Breaker opened, cooldown elapsed: the probe succeeds and closes it.
        let response = facade
            .call(|| service.calculate_tax(tax_request()))
            .await
            .unwrap();
        assert_eq!(response.tax_amount, Money::from_cents(800));
    }

    #[tokio::test]
    async fn per_attempt_timeout_is_transient() {
        let facade = ClientFacade::new(
            "tax-service",
            FacadeConfig {
                attempts: 2,
                timeout: Duration::from_millis(10),
                ..fast_config()
            },
        );

        let err = facade
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), ClientError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 2, .. }));
    }
}
