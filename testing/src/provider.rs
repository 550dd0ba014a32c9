//! Scriptable payment provider for tests.
//!
//! Issues fake BOLT11 invoices with unique payment hashes and reports
//! whatever status the test has set for them (pending by default). Failures
//! can be queued per operation or switched on for every call.

use async_trait::async_trait;
use lnticket_core::ProviderError;
use lnticket_core::provider::{IssuedInvoice, PaymentProvider, ProviderResult, ProviderStatus};
use lnticket_core::types::Sats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct ProviderBook {
    amounts: HashMap<String, Sats>,
    statuses: HashMap<String, ProviderStatus>,
    issued: Vec<IssuedInvoice>,
}

#[derive(Debug, Default)]
struct MockState {
    book: Mutex<ProviderBook>,
    fail_creates: AtomicU32,
    fail_status: AtomicU32,
    unreachable: AtomicBool,
    create_calls: AtomicUsize,
    status_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// Mock [`PaymentProvider`].
///
/// Clones share state, so a test can keep a handle after giving one to
/// the engine.
///
/// # Example
///
/// ```ignore
/// let provider = MockPaymentProvider::new();
/// provider.fail_next_creates(1);
///
/// let err = engine.purchase_ticket(event_id, user_id).await.unwrap_err();
/// assert!(matches!(err, TicketingError::PaymentProviderUnavailable(_)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockPaymentProvider {
    state: Arc<MockState>,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockPaymentProvider {
    /// Create a provider that issues invoices and reports them pending
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)] // Test utility
    fn book(&self) -> MutexGuard<'_, ProviderBook> {
        self.state.book.lock().unwrap()
    }

    /// Fail the next `n` invoice creations with [`ProviderError::Unavailable`]
    pub fn fail_next_creates(&self, n: u32) {
        self.state.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` status lookups with [`ProviderError::Unavailable`]
    pub fn fail_next_status(&self, n: u32) {
        self.state.fail_status.store(n, Ordering::SeqCst);
    }

    /// Fail every call until switched back
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::unwrap_used)] // Test utility
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().unwrap() = Some(latency);
    }

    /// Report `status` for the invoice with this payment hash
    pub fn set_status(&self, payment_hash: &str, status: ProviderStatus) {
        self.book().statuses.insert(payment_hash.to_string(), status);
    }

    /// Report the invoice as paid in full
    pub fn mark_paid(&self, payment_hash: &str) {
        let mut book = self.book();
        let amount = book.amounts.get(payment_hash).copied().unwrap_or(Sats::ZERO);
        book.statuses
            .insert(payment_hash.to_string(), ProviderStatus::paid(amount));
    }

    /// Number of `create_invoice` calls, including failed ones
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_status` calls, including failed ones
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.state.status_calls.load(Ordering::SeqCst)
    }

    /// Every invoice issued so far, in order
    #[must_use]
    pub fn issued_invoices(&self) -> Vec<IssuedInvoice> {
        self.book().issued.clone()
    }

    #[allow(clippy::unwrap_used)] // Test utility
    async fn simulate_network(&self) -> ProviderResult<()> {
        let latency = *self.state.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("mock provider unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_invoice(
        &self,
        amount: Sats,
        description: &str,
        _expiry_secs: u64,
    ) -> ProviderResult<IssuedInvoice> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;
        if take(&self.state.fail_creates) {
            return Err(ProviderError::Unavailable("injected create failure".to_string()));
        }

        let payment_hash = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let issued = IssuedInvoice {
            bolt11: format!("lnbcrt{}n1mock{}", amount.value(), &payment_hash[..16]),
            payment_hash: payment_hash.clone(),
            provider_invoice_id: payment_hash.clone(),
        };

        tracing::debug!(
            payment_hash = %payment_hash,
            amount = amount.value(),
            description,
            "Mock invoice issued"
        );

        let mut book = self.book();
        book.amounts.insert(payment_hash, amount);
        book.issued.push(issued.clone());
        Ok(issued)
    }

    async fn get_status(&self, provider_invoice_id: &str) -> ProviderResult<ProviderStatus> {
        self.state.status_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;
        if take(&self.state.fail_status) {
            return Err(ProviderError::Unavailable("injected status failure".to_string()));
        }

        let book = self.book();
        if !book.amounts.contains_key(provider_invoice_id) {
            return Err(ProviderError::Rejected(format!(
                "unknown invoice {provider_invoice_id}"
            )));
        }
        Ok(book
            .statuses
            .get(provider_invoice_id)
            .copied()
            .unwrap_or_else(ProviderStatus::pending))
    }
}
