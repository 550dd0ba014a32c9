//! Ledger contract: transactional persistence of events, tickets, invoices
//! and payments.
//!
//! The engine owns transaction boundaries. It opens a [`LedgerTx`] with
//! [`Ledger::begin`], composes the row-level operations it needs, and either
//! commits or drops the transaction (dropping rolls back).
//!
//! # Locking
//!
//! The `lock_*` methods take an exclusive row lock that is held until the
//! transaction ends. Implementations must bound the wait and report an
//! expired wait as [`LedgerError::LockTimeout`]. Callers acquire locks in the
//! order ticket → event → invoice.

use crate::error::LedgerError;
use crate::types::{
    Event, EventId, Invoice, InvoiceId, InvoiceStatus, Payment, Ticket, TicketId, TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// One open ledger transaction.
///
/// Dropping the transaction without calling [`LedgerTx::commit`] discards
/// every write made through it.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock the event row and return it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::LockTimeout`] if the lock wait exceeds the deadline.
    async fn lock_event(&mut self, event_id: EventId) -> LedgerResult<Option<Event>>;

    /// Count tickets of the event that occupy a slot (pending or paid).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn live_ticket_count(&mut self, event_id: EventId) -> LedgerResult<u32>;

    /// Insert a new ticket.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Conflict`] if the id or ticket code already exists.
    async fn insert_ticket(&mut self, ticket: &Ticket) -> LedgerResult<()>;

    /// Lock the ticket row and return it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::LockTimeout`] if the lock wait exceeds the deadline.
    async fn lock_ticket(&mut self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>>;

    /// Set the ticket status.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the ticket does not exist.
    async fn update_ticket_status(
        &mut self,
        ticket_id: TicketId,
        status: TicketStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Point the ticket at its current invoice.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the ticket does not exist.
    async fn set_ticket_invoice(
        &mut self,
        ticket_id: TicketId,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Insert a new invoice.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Conflict`] if the payment hash already exists or the
    /// ticket already has a pending invoice.
    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()>;

    /// Lock the invoice row and return it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::LockTimeout`] if the lock wait exceeds the deadline.
    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>>;

    /// Set the invoice status; terminal statuses also stamp `settled_at`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the invoice does not exist.
    async fn update_invoice_status(
        &mut self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Append a payment record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Conflict`] if the invoice already has a payment.
    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()>;

    /// Make every write visible and release all locks.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; nothing was written in that case.
    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    /// Discard every write and release all locks.
    ///
    /// # Errors
    ///
    /// Returns error if the rollback could not be sent to storage.
    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}

/// Relational store behind the engine.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if no connection is available.
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>>;

    /// Insert an event. Event management lives outside the engine; this exists
    /// so operators and tests can seed inventory.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Conflict`] if the id already exists.
    async fn insert_event(&self, event: &Event) -> LedgerResult<()>;

    /// Load an event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn get_event(&self, event_id: EventId) -> LedgerResult<Option<Event>>;

    /// Count live tickets outside any transaction (for reporting).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn live_ticket_count(&self, event_id: EventId) -> LedgerResult<u32>;

    /// Load a ticket.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn get_ticket(&self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>>;

    /// Load an invoice.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn get_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>>;

    /// Find an invoice by its payment hash.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn find_invoice_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> LedgerResult<Option<Invoice>>;

    /// All invoices ever issued for a ticket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn invoices_for_ticket(&self, ticket_id: TicketId) -> LedgerResult<Vec<Invoice>>;

    /// The payment recorded for an invoice, if settled.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn payment_for_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Payment>>;

    /// Pending invoices, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn pending_invoices(&self, limit: usize) -> LedgerResult<Vec<Invoice>>;

    /// Pending invoices whose deadline is before `now`, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn expired_pending_invoices(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Invoice>>;

    /// Pending tickets with no pending invoice behind them, last touched
    /// before `updated_before`.
    ///
    /// These are reservations whose invoice was never persisted: a crash
    /// between reserving and storing the invoice, on purchase or on retry.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn orphaned_pending_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Ticket>>;
}
