//! PostgreSQL ledger for Lightning ticket sales.
//!
//! Implements [`Ledger`] and [`LedgerTx`] on top of a `sqlx` connection
//! pool. Row locks are taken with `SELECT ... FOR UPDATE` and every
//! transaction bounds its lock waits with `SET LOCAL lock_timeout`, so a
//! stuck holder surfaces as [`LedgerError::LockTimeout`] instead of a hang.
//!
//! # Example
//!
//! ```no_run
//! use lnticket_postgres::PostgresLedger;
//! use sqlx::postgres::PgPoolOptions;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPoolOptions::new()
//!     .max_connections(10)
//!     .connect("postgres://localhost/lnticket")
//!     .await?;
//! let ledger = PostgresLedger::new(pool, Duration::from_secs(2));
//! ledger.migrate().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//!
//! - `lnticket_ledger_errors_total{kind}`: storage failures by mapped kind

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lnticket_core::error::LedgerError;
use lnticket_core::ledger::{Ledger, LedgerResult, LedgerTx};
use lnticket_core::types::{
    Event, EventId, Invoice, InvoiceId, InvoiceStatus, Payment, PaymentId, PaymentStatus, Sats,
    Ticket, TicketCode, TicketId, TicketStatus, UserId,
};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{Executor, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// PostgreSQL implementation of [`Ledger`].
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedger {
    /// Create a ledger over an existing pool.
    ///
    /// `lock_timeout` bounds every row-lock wait inside transactions opened
    /// by [`Ledger::begin`].
    #[must_use]
    pub const fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Run the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if a migration fails.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PostgresLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLedger")
            .field("pool_size", &self.pool.size())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Map a driver error onto the ledger's error kinds.
///
/// `55P03` is `lock_not_available`, raised when `lock_timeout` expires.
/// Serialization failures, deadlocks and unique violations are all reported
/// as conflicts because retrying the whole transaction may succeed.
fn map_err(context: &str, err: sqlx::Error) -> LedgerError {
    let mapped = match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("55P03") => LedgerError::LockTimeout(format!("{context}: {}", db.message())),
            Some("40001" | "40P01" | "23505") => {
                LedgerError::Conflict(format!("{context}: {}", db.message()))
            }
            Some("23503") => LedgerError::NotFound(format!("{context}: {}", db.message())),
            _ => LedgerError::Database(format!("{context}: {err}")),
        },
        sqlx::Error::PoolTimedOut => {
            LedgerError::LockTimeout(format!("{context}: connection pool exhausted"))
        }
        sqlx::Error::RowNotFound => LedgerError::NotFound(context.to_string()),
        _ => LedgerError::Database(format!("{context}: {err}")),
    };

    let kind = match &mapped {
        LedgerError::NotFound(_) => "not_found",
        LedgerError::Conflict(_) => "conflict",
        LedgerError::LockTimeout(_) => "lock_timeout",
        LedgerError::Database(_) => "database",
    };
    metrics::counter!("lnticket_ledger_errors_total", "kind" => kind).increment(1);
    tracing::debug!(context, error = %mapped, "Ledger query failed");
    mapped
}

fn decode_err(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Database(format!("Corrupt row: {err}"))
}

fn sats_to_db(sats: Sats) -> LedgerResult<i64> {
    i64::try_from(sats.value()).map_err(|_| LedgerError::Database(format!("{sats} out of range")))
}

fn sats_from_db(value: i64) -> LedgerResult<Sats> {
    u64::try_from(value).map(Sats::new).map_err(decode_err)
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn expect_one(rows: u64, what: &str) -> LedgerResult<()> {
    if rows == 0 {
        Err(LedgerError::NotFound(what.to_string()))
    } else {
        Ok(())
    }
}

// ============================================================================
// Row types
// ============================================================================

const EVENT_COLUMNS: &str = "id, name, capacity, price_sats, is_active, created_at";
const TICKET_COLUMNS: &str =
    "id, event_id, user_id, ticket_code, status, invoice_id, created_at, updated_at";
const INVOICE_COLUMNS: &str = "id, ticket_id, amount_sats, description, bolt11, payment_hash, \
     provider_invoice_id, status, expires_at, created_at, settled_at";
const PAYMENT_COLUMNS: &str = "id, invoice_id, amount_sats, status, paid_at";

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    name: String,
    capacity: i32,
    price_sats: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> LedgerResult<Self> {
        Ok(Self {
            id: EventId::from_uuid(row.id),
            name: row.name,
            capacity: u32::try_from(row.capacity).map_err(decode_err)?,
            price: sats_from_db(row.price_sats)?,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    event_id: Uuid,
    user_id: Uuid,
    ticket_code: String,
    status: String,
    invoice_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = LedgerError;

    fn try_from(row: TicketRow) -> LedgerResult<Self> {
        Ok(Self {
            id: TicketId::from_uuid(row.id),
            event_id: EventId::from_uuid(row.event_id),
            user_id: UserId::from_uuid(row.user_id),
            code: TicketCode::from_string(row.ticket_code),
            status: TicketStatus::parse(&row.status).map_err(decode_err)?,
            invoice_id: row.invoice_id.map(InvoiceId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    ticket_id: Uuid,
    amount_sats: i64,
    description: String,
    bolt11: String,
    payment_hash: String,
    provider_invoice_id: String,
    status: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = LedgerError;

    fn try_from(row: InvoiceRow) -> LedgerResult<Self> {
        Ok(Self {
            id: InvoiceId::from_uuid(row.id),
            ticket_id: TicketId::from_uuid(row.ticket_id),
            amount: sats_from_db(row.amount_sats)?,
            description: row.description,
            bolt11: row.bolt11,
            payment_hash: row.payment_hash,
            provider_invoice_id: row.provider_invoice_id,
            status: InvoiceStatus::parse(&row.status).map_err(decode_err)?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            settled_at: row.settled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    invoice_id: Uuid,
    amount_sats: i64,
    status: String,
    paid_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = LedgerError;

    fn try_from(row: PaymentRow) -> LedgerResult<Self> {
        Ok(Self {
            id: PaymentId::from_uuid(row.id),
            invoice_id: InvoiceId::from_uuid(row.invoice_id),
            amount: sats_from_db(row.amount_sats)?,
            status: PaymentStatus::parse(&row.status).map_err(decode_err)?,
            paid_at: row.paid_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// Shared statements
// ============================================================================

// Used both inside and outside transactions.
async fn count_live_tickets<'e, E>(executor: E, event_id: EventId) -> LedgerResult<u32>
where
    E: Executor<'e, Database = Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tickets WHERE event_id = $1 AND status IN ('pending', 'paid')",
    )
    .bind(event_id.as_uuid())
    .fetch_one(executor)
    .await
    .map_err(|e| map_err("Failed to count live tickets", e))?;

    u32::try_from(count).map_err(decode_err)
}

// ============================================================================
// Transactions
// ============================================================================

/// An open PostgreSQL transaction. Dropping it rolls back.
struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_event(&mut self, event_id: EventId) -> LedgerResult<Option<Event>> {
        sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE"
        ))
        .bind(event_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to lock event", e))?
        .map(Event::try_from)
        .transpose()
    }

    async fn live_ticket_count(&mut self, event_id: EventId) -> LedgerResult<u32> {
        count_live_tickets(&mut *self.tx, event_id).await
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO tickets
                (id, event_id, user_id, ticket_code, status, invoice_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(ticket.id.as_uuid())
        .bind(ticket.event_id.as_uuid())
        .bind(ticket.user_id.as_uuid())
        .bind(ticket.code.as_str())
        .bind(ticket.status.as_str())
        .bind(ticket.invoice_id.map(|id| *id.as_uuid()))
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to insert ticket", e))?;
        Ok(())
    }

    async fn lock_ticket(&mut self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>> {
        sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(ticket_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to lock ticket", e))?
        .map(Ticket::try_from)
        .transpose()
    }

    async fn update_ticket_status(
        &mut self,
        ticket_id: TicketId,
        status: TicketStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE tickets SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(ticket_id.as_uuid())
            .bind(status.as_str())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_err("Failed to update ticket status", e))?;
        expect_one(result.rows_affected(), &format!("ticket {ticket_id}"))
    }

    async fn set_ticket_invoice(
        &mut self,
        ticket_id: TicketId,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let result =
            sqlx::query("UPDATE tickets SET invoice_id = $2, updated_at = $3 WHERE id = $1")
                .bind(ticket_id.as_uuid())
                .bind(invoice_id.as_uuid())
                .bind(at)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_err("Failed to link invoice to ticket", e))?;
        expect_one(result.rows_affected(), &format!("ticket {ticket_id}"))
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO invoices
                (id, ticket_id, amount_sats, description, bolt11, payment_hash,
                 provider_invoice_id, status, expires_at, created_at, settled_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.ticket_id.as_uuid())
        .bind(sats_to_db(invoice.amount)?)
        .bind(&invoice.description)
        .bind(&invoice.bolt11)
        .bind(&invoice.payment_hash)
        .bind(&invoice.provider_invoice_id)
        .bind(invoice.status.as_str())
        .bind(invoice.expires_at)
        .bind(invoice.created_at)
        .bind(invoice.settled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to insert invoice", e))?;
        Ok(())
    }

    async fn lock_invoice(&mut self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 FOR UPDATE"
        ))
        .bind(invoice_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to lock invoice", e))?
        .map(Invoice::try_from)
        .transpose()
    }

    async fn update_invoice_status(
        &mut self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let settled_at = status.is_terminal().then_some(at);
        let result = sqlx::query(
            "UPDATE invoices
             SET status = $2, settled_at = COALESCE($3, settled_at)
             WHERE id = $1",
        )
        .bind(invoice_id.as_uuid())
        .bind(status.as_str())
        .bind(settled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to update invoice status", e))?;
        expect_one(result.rows_affected(), &format!("invoice {invoice_id}"))
    }

    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO payments (id, invoice_id, amount_sats, status, paid_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(payment.id.as_uuid())
        .bind(payment.invoice_id.as_uuid())
        .bind(sats_to_db(payment.amount)?)
        .bind(payment.status.as_str())
        .bind(payment.paid_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_err("Failed to insert payment", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_err("Failed to commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_err("Failed to roll back transaction", e))
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[async_trait]
impl Ledger for PostgresLedger {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err("Failed to start transaction", e))?;

        // SET does not accept bind parameters; the value is an integer.
        let millis = self.lock_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = {millis}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("Failed to set lock timeout", e))?;

        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn insert_event(&self, event: &Event) -> LedgerResult<()> {
        let capacity = i32::try_from(event.capacity)
            .map_err(|_| LedgerError::Database(format!("capacity {} out of range", event.capacity)))?;

        sqlx::query(
            "INSERT INTO events (id, name, capacity, price_sats, is_active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(capacity)
        .bind(sats_to_db(event.price)?)
        .bind(event.is_active)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to insert event", e))?;
        Ok(())
    }

    async fn get_event(&self, event_id: EventId) -> LedgerResult<Option<Event>> {
        sqlx::query_as::<_, EventRow>(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("Failed to get event", e))?
            .map(Event::try_from)
            .transpose()
    }

    async fn live_ticket_count(&self, event_id: EventId) -> LedgerResult<u32> {
        count_live_tickets(&self.pool, event_id).await
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>> {
        sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"
        ))
        .bind(ticket_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to get ticket", e))?
        .map(Ticket::try_from)
        .transpose()
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"
        ))
        .bind(invoice_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to get invoice", e))?
        .map(Invoice::try_from)
        .transpose()
    }

    async fn find_invoice_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> LedgerResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_hash = $1"
        ))
        .bind(payment_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to find invoice by payment hash", e))?
        .map(Invoice::try_from)
        .transpose()
    }

    async fn invoices_for_ticket(&self, ticket_id: TicketId) -> LedgerResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE ticket_id = $1
             ORDER BY created_at, id"
        ))
        .bind(ticket_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to list invoices for ticket", e))?;
        convert_all(rows)
    }

    async fn payment_for_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1"
        ))
        .bind(invoice_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to get payment", e))?
        .map(Payment::try_from)
        .transpose()
    }

    async fn pending_invoices(&self, limit: usize) -> LedgerResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE status = 'pending'
             ORDER BY created_at
             LIMIT $1"
        ))
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to list pending invoices", e))?;
        convert_all(rows)
    }

    async fn expired_pending_invoices(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE status = 'pending' AND expires_at < $1
             ORDER BY expires_at
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to list expired invoices", e))?;
        convert_all(rows)
    }

    async fn orphaned_pending_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Ticket>> {
        let rows = sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets t
             WHERE t.status = 'pending'
               AND t.updated_at < $1
               AND NOT EXISTS (
                   SELECT 1 FROM invoices i
                   WHERE i.ticket_id = t.id AND i.status = 'pending'
               )
             ORDER BY t.updated_at
             LIMIT $2"
        ))
        .bind(updated_before)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to list orphaned tickets", e))?;
        convert_all(rows)
    }
}
