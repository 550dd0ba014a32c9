//! Invoice lifecycle manager.
//!
//! Issues invoices through the payment provider and ties them to their
//! ticket. The provider is always called outside any ledger transaction, so
//! no row lock is held across a network round trip.

use crate::allocator::InventoryAllocator;
use crate::config::InvoiceConfig;
use crate::metrics;
use lnticket_core::environment::Clock;
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::PaymentProvider;
use lnticket_core::types::{
    Event, Invoice, InvoiceId, InvoiceStatus, Sats, Ticket, TicketId, TicketStatus,
};
use lnticket_core::{Result, TicketingError};
use std::sync::Arc;

/// Creates and retries invoices.
pub struct InvoiceLifecycleManager {
    ledger: Arc<dyn Ledger>,
    provider: Arc<dyn PaymentProvider>,
    allocator: Arc<InventoryAllocator>,
    clock: Arc<dyn Clock>,
    config: InvoiceConfig,
}

/// Description embedded in the invoice
#[must_use]
pub fn invoice_description(event: &Event, ticket: &Ticket) -> String {
    format!("{} ticket {}", event.name, ticket.code)
}

impl InvoiceLifecycleManager {
    /// Creates a new `InvoiceLifecycleManager`
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provider: Arc<dyn PaymentProvider>,
        allocator: Arc<InventoryAllocator>,
        clock: Arc<dyn Clock>,
        config: InvoiceConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            allocator,
            clock,
            config,
        }
    }

    /// Issue an invoice for a freshly reserved (pending) ticket.
    ///
    /// If the provider fails, or the issued invoice cannot be stored, the
    /// ticket's slot is released as `failed` before the error is returned.
    /// No invoice is ever fabricated.
    ///
    /// # Errors
    ///
    /// [`TicketingError::PaymentProviderUnavailable`] if the provider fails,
    /// or the ledger error that prevented storing the invoice.
    #[tracing::instrument(skip(self, ticket, description), fields(ticket_id = %ticket.id))]
    pub async fn create_invoice(
        &self,
        ticket: &Ticket,
        amount: Sats,
        description: &str,
    ) -> Result<Invoice> {
        let issued = match self
            .provider
            .create_invoice(amount, description, self.config.ttl_secs)
            .await
        {
            Ok(issued) => issued,
            Err(err) => {
                tracing::warn!(error = %err, "Provider could not issue invoice");
                self.release_after_failure(ticket.id).await;
                return Err(err.into());
            }
        };

        let now = self.clock.now();
        let invoice = Invoice {
            id: InvoiceId::new(),
            ticket_id: ticket.id,
            amount,
            description: description.to_string(),
            bolt11: issued.bolt11,
            payment_hash: issued.payment_hash,
            provider_invoice_id: issued.provider_invoice_id,
            status: InvoiceStatus::Pending,
            expires_at: self.config.deadline(now),
            created_at: now,
            settled_at: None,
        };

        if let Err(err) = self.persist(&invoice).await {
            tracing::error!(
                error = %err,
                payment_hash = %invoice.payment_hash,
                "Issued invoice could not be stored; it will lapse unpaid"
            );
            self.release_after_failure(ticket.id).await;
            return Err(err);
        }

        metrics::record_invoice_created();
        tracing::info!(
            invoice_id = %invoice.id,
            amount = %invoice.amount,
            expires_at = %invoice.expires_at,
            "Invoice issued"
        );
        Ok(invoice)
    }

    async fn persist(&self, invoice: &Invoice) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        let ticket = tx
            .lock_ticket(invoice.ticket_id)
            .await?
            .ok_or(TicketingError::TicketNotFound(invoice.ticket_id))?;
        // The sweeper may have reclaimed the reservation while the provider
        // call was in flight.
        if ticket.status != TicketStatus::Pending {
            return Err(TicketingError::InvalidStateTransition {
                ticket_id: ticket.id,
                ticket_status: ticket.status,
                invoice_status: None,
            });
        }
        tx.insert_invoice(invoice).await?;
        tx.set_ticket_invoice(ticket.id, invoice.id, invoice.created_at)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release_after_failure(&self, ticket_id: TicketId) {
        if let Err(err) = self
            .allocator
            .release_slot(ticket_id, TicketStatus::Failed)
            .await
        {
            // The orphan sweep reclaims the slot later.
            tracing::error!(ticket_id = %ticket_id, error = %err, "Could not release slot");
        }
    }

    /// Issue a fresh invoice for a ticket whose current invoice expired or
    /// failed.
    ///
    /// The ticket is moved back to `pending`, taking a slot again if capacity
    /// allows. The old invoice is kept unchanged for audit. If the provider
    /// then fails, the slot is released again.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::InvalidStateTransition`] unless the ticket's
    ///   current invoice expired or failed; a ticket whose invoice was never
    ///   issued is bought again instead
    /// - [`TicketingError::CapacityExceeded`] if the event sold out meanwhile
    /// - [`TicketingError::PaymentProviderUnavailable`] if the provider fails
    #[tracing::instrument(skip(self), fields(ticket_id = %ticket_id))]
    pub async fn retry_invoice(&self, ticket_id: TicketId) -> Result<Invoice> {
        let now = self.clock.now();
        let mut tx = self.ledger.begin().await?;

        let ticket = tx
            .lock_ticket(ticket_id)
            .await?
            .ok_or(TicketingError::TicketNotFound(ticket_id))?;
        let current = match ticket.invoice_id {
            Some(invoice_id) => tx.lock_invoice(invoice_id).await?.map(|i| i.status),
            None => None,
        };

        let retryable = matches!(ticket.status, TicketStatus::Expired | TicketStatus::Failed)
            && matches!(current, Some(InvoiceStatus::Expired | InvoiceStatus::Failed));
        if !retryable {
            return Err(TicketingError::InvalidStateTransition {
                ticket_id,
                ticket_status: ticket.status,
                invoice_status: current,
            });
        }

        let event = InventoryAllocator::readmit_in_tx(tx.as_mut(), &ticket, now).await?;
        tx.commit().await?;
        tracing::info!(previous_invoice = ?ticket.invoice_id, "Ticket readmitted for retry");

        let ticket = Ticket {
            status: TicketStatus::Pending,
            updated_at: now,
            ..ticket
        };
        self.create_invoice(&ticket, event.price, &invoice_description(&event, &ticket))
            .await
    }
}
