//! Timeout and circuit breaker around any provider.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::config::ProviderGuardConfig;
use crate::metrics;
use async_trait::async_trait;
use lnticket_core::ProviderError;
use lnticket_core::provider::{IssuedInvoice, PaymentProvider, ProviderResult, ProviderStatus};
use lnticket_core::types::Sats;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decorates a provider with a per-call deadline, a circuit breaker, and
/// call metrics.
///
/// Only transient errors (unreachable, timed out) count towards opening the
/// circuit. An open circuit fails calls with [`ProviderError::CircuitOpen`]
/// without touching the network.
pub struct GuardedProvider {
    inner: Arc<dyn PaymentProvider>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GuardedProvider {
    /// Wrap `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn PaymentProvider>, config: &ProviderGuardConfig) -> Self {
        let breaker = CircuitBreaker::new(
            inner.name(),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                open_for: Duration::from_secs(config.circuit_open_secs),
            },
        );
        Self {
            inner,
            breaker,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// The breaker, for inspection
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guard<T, F>(&self, op: &'static str, call: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        let started = Instant::now();
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(
                || async move {
                    tokio::time::timeout(timeout, call)
                        .await
                        .unwrap_or(Err(ProviderError::Timeout))
                },
                ProviderError::is_transient,
            )
            .await;

        let result = result.map_err(|err| match err {
            CircuitBreakerError::Open => ProviderError::CircuitOpen,
            CircuitBreakerError::Inner(err) => err,
        });

        metrics::record_provider_call(op, started.elapsed(), result.is_err());
        if let Err(err) = &result {
            tracing::warn!(provider = self.inner.name(), op, error = %err, "Provider call failed");
        }
        result
    }
}

#[async_trait]
impl PaymentProvider for GuardedProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create_invoice(
        &self,
        amount: Sats,
        description: &str,
        expiry_secs: u64,
    ) -> ProviderResult<IssuedInvoice> {
        self.guard(
            "create_invoice",
            self.inner.create_invoice(amount, description, expiry_secs),
        )
        .await
    }

    async fn get_status(&self, provider_invoice_id: &str) -> ProviderResult<ProviderStatus> {
        self.guard("get_status", self.inner.get_status(provider_invoice_id))
            .await
    }
}
