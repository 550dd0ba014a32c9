//! Settlement poller.
//!
//! Asks the provider for the status of every pending invoice on a fixed
//! tick and feeds definite answers to the reconciler. Invoices leave the
//! pending list once settled, so polling for them stops by itself.

use crate::config::PollerConfig;
use crate::reconciler::ReconcilerHandle;
use crate::retry::{RetryPolicy, retry_with_predicate};
use futures::stream::{self, StreamExt};
use lnticket_core::environment::Clock;
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::PaymentProvider;
use lnticket_core::settlement::SettlementOutcome;
use lnticket_core::types::{Invoice, InvoiceStatus, Observation, ObservationSource};
use lnticket_core::{ProviderError, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Invoices checked
    pub polled: usize,
    /// Invoices that reached a terminal state
    pub settled: usize,
    /// Invoices whose status could not be fetched or applied
    pub errors: usize,
}

/// Periodic status poller.
pub struct SettlementPoller {
    ledger: Arc<dyn Ledger>,
    provider: Arc<dyn PaymentProvider>,
    reconciler: ReconcilerHandle,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
}

impl SettlementPoller {
    /// Creates a new `SettlementPoller`
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provider: Arc<dyn PaymentProvider>,
        reconciler: ReconcilerHandle,
        clock: Arc<dyn Clock>,
        config: PollerConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            reconciler,
            clock,
            config,
        }
    }

    /// Poll one batch of pending invoices. Never fails.
    pub async fn poll_once(&self) -> PollReport {
        let invoices = match self.ledger.pending_invoices(self.config.batch_size).await {
            Ok(invoices) => invoices,
            Err(err) => {
                tracing::error!(error = %err, "Could not list pending invoices");
                return PollReport {
                    errors: 1,
                    ..PollReport::default()
                };
            }
        };

        let mut report = PollReport {
            polled: invoices.len(),
            ..PollReport::default()
        };
        let outcomes: Vec<_> = stream::iter(invoices)
            .map(|invoice| async move {
                let outcome = self.check_invoice(&invoice, ObservationSource::Poll).await;
                (invoice.id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (invoice_id, outcome) in outcomes {
            match outcome {
                Ok(Some(SettlementOutcome::Transitioned { .. })) => report.settled += 1,
                Ok(_) => {}
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(invoice_id = %invoice_id, error = %err, "Poll failed");
                }
            }
        }

        tracing::debug!(?report, "Poll finished");
        report
    }

    /// Fetch the authoritative status of one invoice and apply it.
    ///
    /// Transient provider errors are retried with backoff. A `pending`
    /// answer is not sent to the reconciler.
    ///
    /// # Errors
    ///
    /// [`lnticket_core::TicketingError::PaymentProviderUnavailable`] once
    /// retries are exhausted, or the reconciler's error.
    pub async fn check_invoice(
        &self,
        invoice: &Invoice,
        source: ObservationSource,
    ) -> Result<Option<SettlementOutcome>> {
        let status = retry_with_predicate(
            RetryPolicy::with_max_retries(self.config.max_retries),
            || self.provider.get_status(&invoice.provider_invoice_id),
            ProviderError::is_transient,
        )
        .await?;

        if status.status == InvoiceStatus::Pending {
            return Ok(Some(SettlementOutcome::StillPending));
        }

        let observation = Observation::new(invoice.id, status.status, self.clock.now(), source)
            .with_settled_amount(status.settled_amount);
        self.reconciler.apply(observation).await
    }

    /// Poll every `config.interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.interval(), "Settlement poller started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        tracing::info!("Settlement poller stopped");
    }
}
