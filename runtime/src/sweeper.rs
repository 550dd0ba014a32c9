//! Expiry sweeper.
//!
//! Periodically closes pending invoices past their deadline and reclaims
//! reservations whose invoice was never stored. Invoices are closed through
//! the reconciler mailbox like any other observation; the sweeper never
//! writes invoice rows itself.

use crate::allocator::InventoryAllocator;
use crate::config::SweeperConfig;
use crate::metrics;
use crate::reconciler::ReconcilerHandle;
use chrono::{DateTime, Utc};
use lnticket_core::Result;
use lnticket_core::environment::Clock;
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::PaymentProvider;
use lnticket_core::settlement::SettlementOutcome;
use lnticket_core::types::{Invoice, InvoiceStatus, Observation, ObservationSource, TicketStatus};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Invoices closed unpaid (expired, or failed per the provider)
    pub expired: usize,
    /// Invoices found paid by the final status check
    pub paid: usize,
    /// Invoice-less reservations released
    pub orphans_released: usize,
    /// Invoices or tickets that could not be handled this time
    pub errors: usize,
}

/// Periodic expiry task.
pub struct ExpirySweeper {
    ledger: Arc<dyn Ledger>,
    provider: Arc<dyn PaymentProvider>,
    reconciler: ReconcilerHandle,
    allocator: Arc<InventoryAllocator>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    /// Creates a new `ExpirySweeper`
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provider: Arc<dyn PaymentProvider>,
        reconciler: ReconcilerHandle,
        allocator: Arc<InventoryAllocator>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            reconciler,
            allocator,
            clock,
            config,
        }
    }

    /// Run one sweep. Never fails; problems are logged and counted.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        match self
            .ledger
            .expired_pending_invoices(now, self.config.batch_size)
            .await
        {
            Ok(invoices) => {
                for invoice in invoices {
                    match self.close(&invoice, now).await {
                        Ok(Some(SettlementOutcome::Transitioned {
                            to: InvoiceStatus::Paid,
                            ..
                        })) => report.paid += 1,
                        Ok(Some(SettlementOutcome::Transitioned { .. })) => report.expired += 1,
                        Ok(_) => {}
                        Err(err) => {
                            report.errors += 1;
                            tracing::warn!(invoice_id = %invoice.id, error = %err, "Could not expire invoice");
                        }
                    }
                }
            }
            Err(err) => {
                report.errors += 1;
                tracing::error!(error = %err, "Could not list expired invoices");
            }
        }

        let cutoff = self.config.orphan_cutoff(now);
        match self
            .ledger
            .orphaned_pending_tickets(cutoff, self.config.batch_size)
            .await
        {
            Ok(tickets) => {
                for ticket in tickets {
                    match self.allocator.release_slot(ticket.id, TicketStatus::Failed).await {
                        Ok(true) => {
                            report.orphans_released += 1;
                            tracing::info!(ticket_id = %ticket.id, "Orphaned reservation released");
                        }
                        Ok(false) => {}
                        Err(err) => {
                            report.errors += 1;
                            tracing::warn!(ticket_id = %ticket.id, error = %err, "Could not release orphan");
                        }
                    }
                }
            }
            Err(err) => {
                report.errors += 1;
                tracing::error!(error = %err, "Could not list orphaned reservations");
            }
        }

        metrics::record_sweep();
        if report == SweepReport::default() {
            tracing::trace!("Sweep found nothing to do");
        } else {
            tracing::info!(?report, "Sweep finished");
        }
        report
    }

    /// Close one overdue invoice.
    ///
    /// Asks the provider one last time so a payment that raced the deadline
    /// is not thrown away. Anything but a definite `paid` or `failed` within
    /// the timeout closes the invoice as `expired`.
    async fn close(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementOutcome>> {
        let expired = Observation::new(
            invoice.id,
            InvoiceStatus::Expired,
            now,
            ObservationSource::Sweeper,
        );

        let final_check = tokio::time::timeout(
            self.config.final_check_timeout(),
            self.provider.get_status(&invoice.provider_invoice_id),
        )
        .await;

        let observation = match final_check {
            Ok(Ok(status)) if status.status == InvoiceStatus::Paid => Observation::new(
                invoice.id,
                InvoiceStatus::Paid,
                now,
                ObservationSource::Sweeper,
            )
            .with_settled_amount(status.settled_amount),
            Ok(Ok(status)) if status.status == InvoiceStatus::Failed => Observation::new(
                invoice.id,
                InvoiceStatus::Failed,
                now,
                ObservationSource::Sweeper,
            ),
            Ok(Ok(_)) => expired.clone(),
            Ok(Err(err)) => {
                tracing::debug!(invoice_id = %invoice.id, error = %err, "Final status check failed");
                expired.clone()
            }
            Err(_) => {
                tracing::debug!(invoice_id = %invoice.id, "Final status check timed out");
                expired.clone()
            }
        };

        let outcome = self.reconciler.apply(observation).await?;
        if outcome == Some(SettlementOutcome::Underpaid) {
            // Short payment already reported; the slot still has to come back.
            return self.reconciler.apply(expired).await;
        }
        Ok(outcome)
    }

    /// Sweep every `config.interval` until `shutdown` fires.
    ///
    /// A sweep in progress is finished before the task exits.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.interval(), "Expiry sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        tracing::info!("Expiry sweeper stopped");
    }
}
