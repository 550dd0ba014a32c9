//! Error types for ticket sales and settlement.

use crate::types::{EventId, InvoiceId, InvoiceStatus, TicketId, TicketStatus};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, TicketingError>;

/// Errors raised by a [`Ledger`](crate::ledger::Ledger) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A row the operation depends on does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A uniqueness or serialization conflict; retrying may succeed
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// A row lock could not be acquired within the configured deadline
    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    /// Any other storage failure
    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Whether retrying the whole transaction may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::LockTimeout(_))
    }
}

/// Errors raised by a [`PaymentProvider`](crate::provider::PaymentProvider).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be reached or answered with a server error
    #[error("Payment provider unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline
    #[error("Payment provider timed out")]
    Timeout,

    /// The provider refused the request (bad amount, auth, ...)
    #[error("Payment provider rejected request: {0}")]
    Rejected(String),

    /// The circuit breaker is open; the call was not attempted
    #[error("Payment provider circuit is open")]
    CircuitOpen,

    /// The response could not be understood
    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether a retry with backoff is worthwhile
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Errors surfaced by the ticketing engine.
///
/// Purchase and retry callers receive exactly one of these as the definitive
/// outcome of their call. Reconciliation never surfaces them; it logs and
/// absorbs instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketingError {
    // ═══════════════════════════════════════════════════════════
    // User-facing
    // ═══════════════════════════════════════════════════════════

    /// The event has no remaining slots.
    #[error("Event {event_id} is sold out")]
    CapacityExceeded {
        /// Event that is sold out
        event_id: EventId,
    },

    /// The invoice can no longer be paid.
    #[error("Invoice {invoice_id} has expired")]
    InvoiceExpired {
        /// Expired invoice
        invoice_id: InvoiceId,
    },

    /// Event does not exist.
    #[error("Event {0} not found")]
    EventNotFound(EventId),

    /// Event exists but is not on sale.
    #[error("Event {0} is not on sale")]
    EventInactive(EventId),

    /// Ticket does not exist.
    #[error("Ticket {0} not found")]
    TicketNotFound(TicketId),

    /// Invoice does not exist.
    #[error("Invoice {0} not found")]
    InvoiceNotFound(InvoiceId),

    // ═══════════════════════════════════════════════════════════
    // Transient
    // ═══════════════════════════════════════════════════════════

    /// The payment provider could not issue an invoice; the slot was released.
    #[error("Payment provider unavailable: {0}")]
    PaymentProviderUnavailable(String),

    /// Contention or a lock timeout persisted past the retry budget.
    #[error("Transient failure, retry later: {0}")]
    Transient(String),

    // ═══════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════

    /// An operation was attempted from a state that does not allow it.
    #[error("Invalid state transition for ticket {ticket_id}: {ticket_status} / invoice {invoice_status:?}")]
    InvalidStateTransition {
        /// Ticket involved
        ticket_id: TicketId,
        /// Ticket status at the time
        ticket_status: TicketStatus,
        /// Status of the ticket's current invoice, if any
        invoice_status: Option<InvoiceStatus>,
    },

    /// A settlement observation contradicted a recorded terminal state.
    #[error("Conflicting settlement for invoice {invoice_id}: recorded {recorded}, observed {observed}")]
    DuplicateOrConflictingSettlement {
        /// Invoice involved
        invoice_id: InvoiceId,
        /// Terminal status already recorded
        recorded: InvoiceStatus,
        /// Status that was observed
        observed: InvoiceStatus,
    },

    /// Storage failure that is not transient.
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

impl TicketingError {
    /// Whether the caller may retry the same operation later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PaymentProviderUnavailable(_) | Self::Transient(_)
        )
    }

    /// Whether the error may be shown to an end user as-is
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::InvoiceExpired { .. }
                | Self::EventNotFound(_)
                | Self::EventInactive(_)
                | Self::TicketNotFound(_)
                | Self::InvoiceNotFound(_)
                | Self::PaymentProviderUnavailable(_)
                | Self::Transient(_)
        )
    }

    /// Message safe to return to an end user
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::CapacityExceeded { .. } => "This event is sold out".to_string(),
            Self::InvoiceExpired { .. } => "The invoice has expired".to_string(),
            Self::EventNotFound(_) => "Event not found".to_string(),
            Self::EventInactive(_) => "Tickets for this event are not on sale".to_string(),
            Self::TicketNotFound(_) => "Ticket not found".to_string(),
            Self::InvoiceNotFound(_) => "Invoice not found".to_string(),
            Self::PaymentProviderUnavailable(_) | Self::Transient(_) => {
                "Payment service temporarily unavailable, please try again".to_string()
            }
            Self::InvalidStateTransition { .. }
            | Self::DuplicateOrConflictingSettlement { .. }
            | Self::Ledger(_) => "Internal error".to_string(),
        }
    }
}

impl From<LedgerError> for TicketingError {
    fn from(error: LedgerError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Ledger(error)
        }
    }
}

impl From<ProviderError> for TicketingError {
    fn from(error: ProviderError) -> Self {
        Self::PaymentProviderUnavailable(error.to_string())
    }
}
