//! In-memory ledger for tests.
//!
//! Transactions take an exclusive lock on the whole store, so any two
//! transactions are serialized just as two transactions locking the same
//! rows would be in PostgreSQL. Writes go to a staged copy that replaces
//! the store on commit; dropping the transaction discards it.
//!
//! The store enforces the same uniqueness rules as the SQL schema: ticket
//! codes, payment hashes, one payment per invoice and one pending invoice
//! per ticket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lnticket_core::LedgerError;
use lnticket_core::ledger::{Ledger, LedgerResult, LedgerTx};
use lnticket_core::types::{
    Event, EventId, Invoice, InvoiceId, InvoiceStatus, Payment, PaymentId, Ticket, TicketId,
    TicketStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Default bound on waiting for the store lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
struct LedgerData {
    events: HashMap<EventId, Event>,
    tickets: HashMap<TicketId, Ticket>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
}

impl LedgerData {
    fn live_ticket_count(&self, event_id: EventId) -> u32 {
        let count = self
            .tickets
            .values()
            .filter(|t| t.event_id == event_id && t.status.is_live())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn check_ticket_unique(&self, ticket: &Ticket) -> LedgerResult<()> {
        if self.tickets.contains_key(&ticket.id) {
            return Err(LedgerError::Conflict(format!("ticket {} exists", ticket.id)));
        }
        if self.tickets.values().any(|t| t.code == ticket.code) {
            return Err(LedgerError::Conflict(format!(
                "ticket code {} exists",
                ticket.code
            )));
        }
        Ok(())
    }

    fn check_invoice_unique(&self, invoice: &Invoice) -> LedgerResult<()> {
        if self.invoices.contains_key(&invoice.id) {
            return Err(LedgerError::Conflict(format!("invoice {} exists", invoice.id)));
        }
        if self
            .invoices
            .values()
            .any(|i| i.payment_hash == invoice.payment_hash)
        {
            return Err(LedgerError::Conflict(format!(
                "payment hash {} exists",
                invoice.payment_hash
            )));
        }
        if invoice.status == InvoiceStatus::Pending
            && self.invoices.values().any(|i| {
                i.ticket_id == invoice.ticket_id && i.status == InvoiceStatus::Pending
            })
        {
            return Err(LedgerError::Conflict(format!(
                "ticket {} already has a pending invoice",
                invoice.ticket_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_begins: AtomicU32,
    fail_commits: AtomicU32,
}

impl FaultPlan {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory [`Ledger`] with serializable transactions.
///
/// Clones share the same store.
///
/// # Example
///
/// ```ignore
/// let ledger = InMemoryLedger::new();
/// ledger.insert_event(&event).await?;
///
/// let mut tx = ledger.begin().await?;
/// let event = tx.lock_event(event.id).await?;
/// tx.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    data: Arc<Mutex<LedgerData>>,
    lock_timeout: Duration,
    faults: Arc<FaultPlan>,
}

impl InMemoryLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(LedgerData::default())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// Set how long a transaction waits for the store before failing with
    /// [`LedgerError::LockTimeout`]
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Make the next `n` calls to [`Ledger::begin`] fail
    pub fn fail_next_begins(&self, n: u32) {
        self.faults.fail_begins.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail (the writes are discarded)
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every ticket for an event
    pub async fn tickets_for_event(&self, event_id: EventId) -> Vec<Ticket> {
        let data = self.data.lock().await;
        data.tickets
            .values()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Number of payment records
    pub async fn payment_count(&self) -> usize {
        self.data.lock().await.payments.len()
    }

    /// Overwrite a ticket as-is, bypassing every rule
    pub async fn put_ticket(&self, ticket: Ticket) {
        self.data.lock().await.tickets.insert(ticket.id, ticket);
    }

    /// Overwrite an invoice as-is, bypassing every rule
    pub async fn put_invoice(&self, invoice: Invoice) {
        self.data.lock().await.invoices.insert(invoice.id, invoice);
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Open transaction on an [`InMemoryLedger`].
struct InMemoryTx {
    guard: OwnedMutexGuard<LedgerData>,
    staged: LedgerData,
    faults: Arc<FaultPlan>,
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_event(&mut self, event_id: EventId) -> LedgerResult<Option<Event>> {
        Ok(self.staged.events.get(&event_id).cloned())
    }

    async fn live_ticket_count(&mut self, event_id: EventId) -> LedgerResult<u32> {
        Ok(self.staged.live_ticket_count(event_id))
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> LedgerResult<()> {
        self.staged.check_ticket_unique(ticket)?;
        self.staged.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn lock_ticket(&mut self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>> {
        Ok(self.staged.tickets.get(&ticket_id).cloned())
    }

    async fn update_ticket_status(
        &mut self,
        ticket_id: TicketId,
        status: TicketStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let ticket = self
            .staged
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| LedgerError::NotFound(format!("ticket {ticket_id}")))?;
        ticket.status = status;
        ticket.updated_at = at;
        Ok(())
    }

    async fn set_ticket_invoice(
        &mut self,
        ticket_id: TicketId,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let ticket = self
            .staged
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| LedgerError::NotFound(format!("ticket {ticket_id}")))?;
        ticket.invoice_id = Some(invoice_id);
        ticket.updated_at = at;
        Ok(())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        if !self.staged.tickets.contains_key(&invoice.ticket_id) {
            return Err(LedgerError::NotFound(format!("ticket {}", invoice.ticket_id)));
        }
        self.staged.check_invoice_unique(invoice)?;
        self.staged.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        Ok(self.staged.invoices.get(&invoice_id).cloned())
    }

    async fn update_invoice_status(
        &mut self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let invoice = self
            .staged
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.status = status;
        if status.is_terminal() {
            invoice.settled_at = Some(at);
        }
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        if self
            .staged
            .payments
            .values()
            .any(|p| p.invoice_id == payment.invoice_id)
        {
            return Err(LedgerError::Conflict(format!(
                "invoice {} already has a payment",
                payment.invoice_id
            )));
        }
        self.staged.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let Self {
            mut guard,
            staged,
            faults,
        } = *self;
        if FaultPlan::take(&faults.fail_commits) {
            return Err(LedgerError::Database("injected commit failure".to_string()));
        }
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        if FaultPlan::take(&self.faults.fail_begins) {
            return Err(LedgerError::Database("injected begin failure".to_string()));
        }
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.data).lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout("in-memory ledger is busy".to_string()))?;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            staged,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn insert_event(&self, event: &Event) -> LedgerResult<()> {
        let mut data = self.data.lock().await;
        if data.events.contains_key(&event.id) {
            return Err(LedgerError::Conflict(format!("event {} exists", event.id)));
        }
        data.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, event_id: EventId) -> LedgerResult<Option<Event>> {
        Ok(self.data.lock().await.events.get(&event_id).cloned())
    }

    async fn live_ticket_count(&self, event_id: EventId) -> LedgerResult<u32> {
        Ok(self.data.lock().await.live_ticket_count(event_id))
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>> {
        Ok(self.data.lock().await.tickets.get(&ticket_id).cloned())
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        Ok(self.data.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> LedgerResult<Option<Invoice>> {
        let data = self.data.lock().await;
        Ok(data
            .invoices
            .values()
            .find(|i| i.payment_hash == payment_hash)
            .cloned())
    }

    async fn invoices_for_ticket(&self, ticket_id: TicketId) -> LedgerResult<Vec<Invoice>> {
        let data = self.data.lock().await;
        let mut invoices: Vec<Invoice> = data
            .invoices
            .values()
            .filter(|i| i.ticket_id == ticket_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    async fn payment_for_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Payment>> {
        let data = self.data.lock().await;
        Ok(data
            .payments
            .values()
            .find(|p| p.invoice_id == invoice_id)
            .cloned())
    }

    async fn pending_invoices(&self, limit: usize) -> LedgerResult<Vec<Invoice>> {
        let data = self.data.lock().await;
        let mut invoices: Vec<Invoice> = data
            .invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Pending)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        invoices.truncate(limit);
        Ok(invoices)
    }

    async fn expired_pending_invoices(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Invoice>> {
        let data = self.data.lock().await;
        let mut invoices: Vec<Invoice> = data
            .invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Pending && i.is_past_deadline(now))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.expires_at);
        invoices.truncate(limit);
        Ok(invoices)
    }

    async fn orphaned_pending_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Ticket>> {
        let data = self.data.lock().await;
        let mut tickets: Vec<Ticket> = data
            .tickets
            .values()
            .filter(|t| t.status == TicketStatus::Pending && t.updated_at < updated_before)
            .filter(|t| {
                !data
                    .invoices
                    .values()
                    .any(|i| i.ticket_id == t.id && i.status == InvoiceStatus::Pending)
            })
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.updated_at);
        tickets.truncate(limit);
        Ok(tickets)
    }
}
