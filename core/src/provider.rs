//! Payment provider capability.
//!
//! Abstraction over a Lightning wallet or payment service that can issue
//! BOLT11 invoices and report their status. One adapter per concrete
//! provider; the engine picks one at construction.

use crate::error::ProviderError;
use crate::types::{InvoiceStatus, Sats};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Invoice as issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedInvoice {
    /// Encoded payment request
    pub bolt11: String,
    /// Hex payment hash
    pub payment_hash: String,
    /// Identifier to use for status lookups
    pub provider_invoice_id: String,
}

/// Status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Reported status
    pub status: InvoiceStatus,
    /// Amount settled, when paid
    pub settled_amount: Option<Sats>,
}

impl ProviderStatus {
    /// Still waiting for payment
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            status: InvoiceStatus::Pending,
            settled_amount: None,
        }
    }

    /// Paid in full
    #[must_use]
    pub const fn paid(amount: Sats) -> Self {
        Self {
            status: InvoiceStatus::Paid,
            settled_amount: Some(amount),
        }
    }
}

/// Unverified notification pushed by the provider to our callback.
///
/// The payload is not authenticated, so it is only ever used to trigger an
/// authoritative [`PaymentProvider::get_status`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    /// Payment hash the notification refers to
    pub payment_hash: String,
    /// Status the provider claims
    pub status: String,
}

/// Capability interface for a payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Short name for logs and metrics
    fn name(&self) -> &'static str;

    /// Issue an invoice for `amount`.
    ///
    /// # Errors
    ///
    /// Returns error if the provider cannot issue the invoice. Implementations
    /// must never fabricate an invoice on failure.
    async fn create_invoice(
        &self,
        amount: Sats,
        description: &str,
        expiry_secs: u64,
    ) -> ProviderResult<IssuedInvoice>;

    /// Look up the current status of an invoice.
    ///
    /// # Errors
    ///
    /// Returns error if the status cannot be determined.
    async fn get_status(&self, provider_invoice_id: &str) -> ProviderResult<ProviderStatus>;
}
