//! Payment provider adapters.
//!
//! One adapter per concrete provider, picked from [`ProviderConfig`] at
//! construction and wrapped in a [`GuardedProvider`].

mod guarded;
mod lnbits;

pub use guarded::GuardedProvider;
pub use lnbits::LnbitsProvider;

use crate::config::ProviderGuardConfig;
use lnticket_core::ProviderError;
use lnticket_core::provider::PaymentProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which payment provider to talk to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// LNbits-style wallet API
    Lnbits {
        /// API root, e.g. `https://lnbits.example.com`
        base_url: String,
        /// Invoice/read key for the receiving wallet
        api_key: String,
    },
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lnbits { base_url, .. } => f
                .debug_struct("Lnbits")
                .field("base_url", base_url)
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Build the configured adapter behind a timeout and circuit breaker.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] if the adapter cannot be constructed
/// from the given settings.
pub fn build_provider(
    config: &ProviderConfig,
    guard: &ProviderGuardConfig,
) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
    let inner: Arc<dyn PaymentProvider> = match config {
        ProviderConfig::Lnbits { base_url, api_key } => {
            Arc::new(LnbitsProvider::new(base_url, api_key)?)
        }
    };
    Ok(Arc::new(GuardedProvider::new(inner, guard)))
}
