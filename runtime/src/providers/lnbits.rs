//! LNbits wallet adapter.
//!
//! - `POST /api/v1/payments` with `{"out": false, "amount", "memo", "expiry"}`
//!   issues an incoming invoice.
//! - `GET /api/v1/payments/{payment_hash}` reports `{"paid": bool, "details": {...}}`.
//!
//! Both calls authenticate with the wallet's invoice key in `X-Api-Key`.
//! The payment hash doubles as the provider invoice id.

use async_trait::async_trait;
use lnticket_core::ProviderError;
use lnticket_core::provider::{IssuedInvoice, PaymentProvider, ProviderResult, ProviderStatus};
use lnticket_core::types::{InvoiceStatus, Sats};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct CreateInvoiceRequest<'a> {
    out: bool,
    amount: u64,
    memo: &'a str,
    expiry: u64,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    payment_hash: String,
    #[serde(alias = "bolt11")]
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct PaymentStatusResponse {
    paid: bool,
    #[serde(default)]
    details: Option<PaymentDetails>,
}

#[derive(Debug, Deserialize)]
struct PaymentDetails {
    /// Millisatoshis
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

/// [`PaymentProvider`] backed by an LNbits wallet.
#[derive(Clone)]
pub struct LnbitsProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for LnbitsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LnbitsProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LnbitsProvider {
    /// Create an adapter for the wallet at `base_url`.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Rejected`] if `base_url` is not an http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: &str) -> ProviderResult<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProviderError::Rejected(format!(
                "LNbits URL must be http(s): {base_url}"
            )));
        }
        let client = Client::builder()
            .user_agent(concat!("lnticket/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Rejected(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn transport_error(err: &reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }

    async fn check_status(response: Response) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::Unavailable(format!(
                "rate limited: {body}"
            ))),
            s if s.is_server_error() => Err(ProviderError::Unavailable(format!("{s}: {body}"))),
            s => Err(ProviderError::Rejected(format!("{s}: {body}"))),
        }
    }

    fn map_status(response: &PaymentStatusResponse) -> ProviderStatus {
        let details = response.details.as_ref();
        let settled_amount = details
            .and_then(|d| d.amount)
            .map(|msat| Sats::new(msat.unsigned_abs() / 1000));

        if response.paid {
            return ProviderStatus {
                status: InvoiceStatus::Paid,
                settled_amount,
            };
        }
        let status = match details.and_then(|d| d.status.as_deref()) {
            Some("failed") => InvoiceStatus::Failed,
            Some("expired") => InvoiceStatus::Expired,
            _ => InvoiceStatus::Pending,
        };
        ProviderStatus {
            status,
            settled_amount: None,
        }
    }
}

#[async_trait]
impl PaymentProvider for LnbitsProvider {
    fn name(&self) -> &'static str {
        "lnbits"
    }

    async fn create_invoice(
        &self,
        amount: Sats,
        description: &str,
        expiry_secs: u64,
    ) -> ProviderResult<IssuedInvoice> {
        let request = CreateInvoiceRequest {
            out: false,
            amount: amount.value(),
            memo: description,
            expiry: expiry_secs,
        };

        let response = self
            .client
            .post(format!("{}/api/v1/payments", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        let created: CreateInvoiceResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        if created.payment_hash.is_empty() || created.payment_request.is_empty() {
            return Err(ProviderError::Malformed(
                "invoice response without payment hash or request".to_string(),
            ));
        }

        Ok(IssuedInvoice {
            bolt11: created.payment_request,
            provider_invoice_id: created.payment_hash.clone(),
            payment_hash: created.payment_hash,
        })
    }

    async fn get_status(&self, provider_invoice_id: &str) -> ProviderResult<ProviderStatus> {
        let response = self
            .client
            .get(format!("{}/api/v1/payments/{provider_invoice_id}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        let status: PaymentStatusResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(Self::map_status(&status))
    }
}
