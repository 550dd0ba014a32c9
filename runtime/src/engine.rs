//! Ticketing engine facade.
//!
//! [`TicketingEngine`] wires the allocator, invoice manager, reconciler
//! mailbox, sweeper and poller from one [`EngineConfig`] and exposes the
//! caller-facing operations. Background tasks run once [`TicketingEngine::start`]
//! is called and stop with [`RunningEngine::shutdown`].
//!
//! # Example
//!
//! ```rust,no_run
//! use lnticket_core::environment::SystemClock;
//! use lnticket_core::types::{EventId, UserId};
//! use lnticket_runtime::{EngineConfig, TicketingEngine, build_provider};
//! use lnticket_testing::InMemoryLedger;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let provider = build_provider(&config.provider, &config.provider_guard)?;
//! let engine = TicketingEngine::new(
//!     Arc::new(InMemoryLedger::new()),
//!     provider,
//!     Arc::new(SystemClock),
//!     config,
//! );
//! let running = engine.start();
//!
//! let (ticket, invoice) = engine.purchase_ticket(EventId::new(), UserId::new()).await?;
//! println!("pay {} for {}", invoice.bolt11, ticket.code);
//!
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::allocator::InventoryAllocator;
use crate::config::EngineConfig;
use crate::invoices::{InvoiceLifecycleManager, invoice_description};
use crate::poller::{PollReport, SettlementPoller};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::sweeper::{ExpirySweeper, SweepReport};
use lnticket_core::environment::Clock;
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::{PaymentProvider, PushNotification};
use lnticket_core::settlement::SettlementOutcome;
use lnticket_core::types::{
    EventId, Invoice, InvoiceStatus, Observation, ObservationSource, Ticket, TicketId,
    TicketStatus, UserId,
};
use lnticket_core::{Result, TicketingError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// The ticketing engine.
pub struct TicketingEngine {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    allocator: Arc<InventoryAllocator>,
    invoices: InvoiceLifecycleManager,
    reconciler: ReconcilerHandle,
    sweeper: Arc<ExpirySweeper>,
    poller: Arc<SettlementPoller>,
    shutdown: broadcast::Sender<()>,
    mailbox_workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl TicketingEngine {
    /// Build the engine and spawn its settlement mailbox workers.
    ///
    /// The sweeper and poller do not run until [`Self::start`]. Must be
    /// called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        let allocator = Arc::new(InventoryAllocator::new(
            Arc::clone(&ledger),
            Arc::clone(&clock),
            &config.allocator,
        ));
        let invoices = InvoiceLifecycleManager::new(
            Arc::clone(&ledger),
            Arc::clone(&provider),
            Arc::clone(&allocator),
            Arc::clone(&clock),
            config.invoice,
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&ledger),
            config.reconciler.policy.clone(),
        ));
        let (handle, mailbox_workers) =
            ReconcilerHandle::spawn(reconciler, &config.reconciler, &shutdown);
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&ledger),
            Arc::clone(&provider),
            handle.clone(),
            Arc::clone(&allocator),
            Arc::clone(&clock),
            config.sweeper,
        ));
        let poller = Arc::new(SettlementPoller::new(
            Arc::clone(&ledger),
            provider,
            handle.clone(),
            Arc::clone(&clock),
            config.poller,
        ));

        Self {
            ledger,
            clock,
            allocator,
            invoices,
            reconciler: handle,
            sweeper,
            poller,
            shutdown,
            mailbox_workers: Mutex::new(mailbox_workers),
            shutdown_timeout: config.server.shutdown_timeout(),
        }
    }

    /// Reserve a slot and issue its invoice.
    ///
    /// Returns a usable ticket and invoice, or one terminal error. When the
    /// invoice cannot be issued the slot is released before returning.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::CapacityExceeded`] if the event is sold out
    /// - [`TicketingError::EventNotFound`] / [`TicketingError::EventInactive`]
    /// - [`TicketingError::PaymentProviderUnavailable`] if no invoice could be issued
    /// - [`TicketingError::Transient`] under persistent contention
    #[tracing::instrument(skip(self), fields(event_id = %event_id, user_id = %user_id))]
    pub async fn purchase_ticket(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(Ticket, Invoice)> {
        let (ticket, event) = self.allocator.reserve_slot(event_id, user_id).await?;
        let invoice = self
            .invoices
            .create_invoice(&ticket, event.price, &invoice_description(&event, &ticket))
            .await?;

        let ticket = Ticket {
            invoice_id: Some(invoice.id),
            ..ticket
        };
        tracing::info!(ticket_id = %ticket.id, invoice_id = %invoice.id, "Ticket reserved");
        Ok((ticket, invoice))
    }

    /// Current status of a ticket.
    ///
    /// # Errors
    ///
    /// [`TicketingError::TicketNotFound`] for an unknown ticket.
    pub async fn get_ticket_status(&self, ticket_id: TicketId) -> Result<TicketStatus> {
        Ok(self.ticket(ticket_id).await?.status)
    }

    /// The invoice the ticket holder should pay now.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::TicketNotFound`] for an unknown ticket
    /// - [`TicketingError::InvalidStateTransition`] if no invoice was ever stored
    /// - [`TicketingError::InvoiceExpired`] if the invoice can no longer be paid
    pub async fn current_invoice(&self, ticket_id: TicketId) -> Result<Invoice> {
        let ticket = self.ticket(ticket_id).await?;
        let invoice_id = ticket
            .invoice_id
            .ok_or(TicketingError::InvalidStateTransition {
                ticket_id,
                ticket_status: ticket.status,
                invoice_status: None,
            })?;
        let invoice = self
            .ledger
            .get_invoice(invoice_id)
            .await?
            .ok_or(TicketingError::InvoiceNotFound(invoice_id))?;

        let unpayable = matches!(invoice.status, InvoiceStatus::Expired | InvoiceStatus::Failed)
            || (invoice.status == InvoiceStatus::Pending
                && invoice.is_past_deadline(self.clock.now()));
        if unpayable {
            return Err(TicketingError::InvoiceExpired { invoice_id });
        }
        Ok(invoice)
    }

    /// Issue a new invoice for a ticket whose invoice expired or failed.
    ///
    /// The previous invoice is kept for audit.
    ///
    /// # Errors
    ///
    /// See [`InvoiceLifecycleManager::retry_invoice`].
    pub async fn admin_retry_payment(&self, ticket_id: TicketId) -> Result<Invoice> {
        self.invoices.retry_invoice(ticket_id).await
    }

    /// Handle a push notification from the provider.
    ///
    /// The payload is not trusted: it only triggers an authoritative status
    /// poll for the invoice it names. Errors are logged, never returned; the
    /// periodic poller covers anything missed here.
    #[tracing::instrument(skip(self, push), fields(payment_hash = %push.payment_hash))]
    pub async fn handle_push(&self, push: PushNotification) -> Option<SettlementOutcome> {
        let invoice = match self.ledger.find_invoice_by_payment_hash(&push.payment_hash).await {
            Ok(Some(invoice)) => invoice,
            Ok(None) => {
                tracing::warn!("Push for unknown payment hash ignored");
                return None;
            }
            Err(err) => {
                tracing::error!(error = %err, "Could not look up pushed invoice");
                return None;
            }
        };

        tracing::debug!(invoice_id = %invoice.id, claimed = %push.status, "Push received");
        // Expired and failed invoices are still checked: a late payment must
        // be reported.
        if invoice.status == InvoiceStatus::Paid {
            return Some(SettlementOutcome::Duplicate);
        }

        match self.poller.check_invoice(&invoice, ObservationSource::Push).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(invoice_id = %invoice.id, error = %err, "Push-triggered poll failed");
                None
            }
        }
    }

    /// Apply a settlement observation through the reconciler mailbox.
    ///
    /// This is the same entry point the poller, sweeper and push handler
    /// use; operators feed [`ObservationSource::Admin`] observations here.
    ///
    /// # Errors
    ///
    /// See [`ReconcilerHandle::apply`].
    pub async fn apply_observation(
        &self,
        observation: Observation,
    ) -> Result<Option<SettlementOutcome>> {
        self.reconciler.apply(observation).await
    }

    /// Slots still available for an event.
    ///
    /// # Errors
    ///
    /// [`TicketingError::EventNotFound`] for an unknown event.
    pub async fn remaining_capacity(&self, event_id: EventId) -> Result<u32> {
        self.allocator.remaining_capacity(event_id).await
    }

    /// Run one expiry sweep now.
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweeper.sweep_once().await
    }

    /// Run one settlement poll now.
    pub async fn poll_once(&self) -> PollReport {
        self.poller.poll_once().await
    }

    /// Start the sweeper and poller.
    ///
    /// The returned [`RunningEngine`] owns every background task, including
    /// the mailbox workers spawned by [`Self::new`].
    #[must_use]
    pub fn start(&self) -> RunningEngine {
        let workers = std::mem::take(
            &mut *self
                .mailbox_workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = workers
            .into_iter()
            .map(|handle| ("settlement mailbox", handle))
            .collect();

        tasks.push((
            "expiry sweeper",
            tokio::spawn(Arc::clone(&self.sweeper).run(self.shutdown.subscribe())),
        ));
        tasks.push((
            "settlement poller",
            tokio::spawn(Arc::clone(&self.poller).run(self.shutdown.subscribe())),
        ));

        tracing::info!(tasks = tasks.len(), "Ticketing engine started");
        RunningEngine {
            shutdown: self.shutdown.clone(),
            tasks,
            timeout: self.shutdown_timeout,
        }
    }

    async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket> {
        self.ledger
            .get_ticket(ticket_id)
            .await?
            .ok_or(TicketingError::TicketNotFound(ticket_id))
    }
}

/// Background tasks of a started engine.
pub struct RunningEngine {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    timeout: Duration,
}

impl RunningEngine {
    /// Signal every task to stop and wait for them.
    ///
    /// The sweeper and poller finish their current batch; mailbox workers
    /// apply what is already queued. Each task gets at most the configured
    /// shutdown timeout.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down ticketing engine");
        let _ = self.shutdown.send(());

        for (name, handle) in self.tasks {
            match tokio::time::timeout(self.timeout, handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped gracefully"),
                Ok(Err(err)) => tracing::warn!(task = name, error = %err, "Task failed"),
                Err(_) => tracing::warn!(task = name, "Task shutdown timed out"),
            }
        }
        tracing::info!("Ticketing engine stopped");
    }
}
