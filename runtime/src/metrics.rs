//! Prometheus metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `lnticket_reservations_total{outcome}` - reservation attempts by outcome
//! - `lnticket_invoices_created_total` - invoices persisted
//! - `lnticket_settlements_total{status}` - first terminal transitions by status
//! - `lnticket_settlement_anomalies_total{kind}` - conflicting, late or short settlements
//! - `lnticket_sweeps_total` - completed sweeper passes
//! - `lnticket_provider_errors_total{op}` - failed provider calls by operation
//! - `lnticket_ledger_errors_total{kind}` - storage failures (emitted by the Postgres ledger)
//!
//! ## Histograms
//! - `lnticket_provider_call_duration_seconds{op}` - provider call latency
//!
//! # Example
//!
//! ```rust,no_run
//! use lnticket_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Reservation attempts
pub const RESERVATIONS_TOTAL: &str = "lnticket_reservations_total";
/// Persisted invoices
pub const INVOICES_CREATED_TOTAL: &str = "lnticket_invoices_created_total";
/// Terminal transitions
pub const SETTLEMENTS_TOTAL: &str = "lnticket_settlements_total";
/// Settlement anomalies
pub const SETTLEMENT_ANOMALIES_TOTAL: &str = "lnticket_settlement_anomalies_total";
/// Sweeper passes
pub const SWEEPS_TOTAL: &str = "lnticket_sweeps_total";
/// Failed provider calls
pub const PROVIDER_ERRORS_TOTAL: &str = "lnticket_provider_errors_total";
/// Storage failures by kind
pub const LEDGER_ERRORS_TOTAL: &str = "lnticket_ledger_errors_total";
/// Provider call latency
pub const PROVIDER_CALL_DURATION_SECONDS: &str = "lnticket_provider_call_duration_seconds";

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter with its own HTTP listener.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server for `addr`; nothing is bound until [`Self::start`]
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions, install the global recorder and start
    /// serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime, once per process.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!(addr = %self.addr, "Metrics exporter listening");
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        RESERVATIONS_TOTAL,
        "Reservation attempts by outcome (reserved, capacity_exceeded, error)"
    );
    describe_counter!(INVOICES_CREATED_TOTAL, "Invoices issued and persisted");
    describe_counter!(
        SETTLEMENTS_TOTAL,
        "First terminal invoice transitions by status (paid, expired, failed)"
    );
    describe_counter!(
        SETTLEMENT_ANOMALIES_TOTAL,
        "Settlement anomalies by kind (conflicting, late_settlement, underpaid)"
    );
    describe_counter!(SWEEPS_TOTAL, "Completed expiry sweeper passes");
    describe_counter!(
        PROVIDER_ERRORS_TOTAL,
        "Failed payment provider calls by operation"
    );
    describe_counter!(
        LEDGER_ERRORS_TOTAL,
        "Ledger failures by kind (not_found, conflict, lock_timeout, database)"
    );
    describe_histogram!(
        PROVIDER_CALL_DURATION_SECONDS,
        "Payment provider call latency by operation"
    );
}

/// Count a reservation attempt.
pub fn record_reservation(outcome: &'static str) {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Count a persisted invoice.
pub fn record_invoice_created() {
    metrics::counter!(INVOICES_CREATED_TOTAL).increment(1);
}

/// Count a first terminal transition.
pub fn record_settlement(status: &'static str) {
    metrics::counter!(SETTLEMENTS_TOTAL, "status" => status).increment(1);
}

/// Count a settlement anomaly.
pub fn record_anomaly(kind: &'static str) {
    metrics::counter!(SETTLEMENT_ANOMALIES_TOTAL, "kind" => kind).increment(1);
}

/// Count a sweeper pass.
pub fn record_sweep() {
    metrics::counter!(SWEEPS_TOTAL).increment(1);
}

/// Record one provider call.
pub fn record_provider_call(op: &'static str, elapsed: Duration, failed: bool) {
    metrics::histogram!(PROVIDER_CALL_DURATION_SECONDS, "op" => op).record(elapsed.as_secs_f64());
    if failed {
        metrics::counter!(PROVIDER_ERRORS_TOTAL, "op" => op).increment(1);
    }
}
