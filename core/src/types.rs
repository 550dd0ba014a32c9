//! Domain types for Lightning ticket sales.
//!
//! Identifiers, the satoshi money type, status enums and the four ledger
//! records (event, ticket, invoice, payment).

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event (the thing tickets are sold for)
    EventId
);
uuid_id!(
    /// Unique identifier for a ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for an invoice
    InvoiceId
);
uuid_id!(
    /// Unique identifier for a payment record
    PaymentId
);
uuid_id!(
    /// Unique identifier for a buying user
    UserId
);

// ============================================================================
// Sats Value Object
// ============================================================================

/// An amount of satoshis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sats(u64);

impl Sats {
    /// Zero sats
    pub const ZERO: Self = Self(0);

    /// Creates a `Sats` amount
    #[must_use]
    pub const fn new(sats: u64) -> Self {
        Self(sats)
    }

    /// Returns the raw amount
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the amount in millisatoshis, or `None` on overflow
    #[must_use]
    pub const fn checked_msats(&self) -> Option<u64> {
        self.0.checked_mul(1000)
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Sats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sats", self.0)
    }
}

// ============================================================================
// Ticket Code
// ============================================================================

/// Alphabet for ticket codes (no I, L, O, U to avoid misreading)
const TICKET_CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Human-readable unique ticket code, e.g. `TKT-7K2M9QXD`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketCode(String);

impl TicketCode {
    /// Prefix of every generated ticket code
    pub const PREFIX: &'static str = "TKT-";

    /// Generate a random ticket code
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..8)
            .map(|_| {
                let idx = rng.gen_range(0..TICKET_CODE_ALPHABET.len());
                char::from(TICKET_CODE_ALPHABET[idx])
            })
            .collect();
        Self(format!("{}{suffix}", Self::PREFIX))
    }

    /// Wrap an existing code (as loaded from storage)
    #[must_use]
    pub const fn from_string(code: String) -> Self {
        Self(code)
    }

    /// Borrow the code as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Statuses
// ============================================================================

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct ParseStatusError {
    /// Which status type was being parsed
    pub kind: &'static str,
    /// The offending value
    pub value: String,
}

/// Status of a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Slot reserved, awaiting payment
    Pending,
    /// Paid (terminal success)
    Paid,
    /// Invoice expired, slot released
    Expired,
    /// Invoice failed or reservation abandoned, slot released
    Failed,
}

impl TicketStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parse from storage representation
    ///
    /// # Errors
    ///
    /// Returns [`ParseStatusError`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError {
                kind: "ticket",
                value: other.to_string(),
            }),
        }
    }

    /// Whether a ticket in this status occupies a capacity slot
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Paid)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<InvoiceStatus> for TicketStatus {
    fn from(status: InvoiceStatus) -> Self {
        match status {
            InvoiceStatus::Pending => Self::Pending,
            InvoiceStatus::Paid => Self::Paid,
            InvoiceStatus::Expired => Self::Expired,
            InvoiceStatus::Failed => Self::Failed,
        }
    }
}

/// Status of an invoice. `Paid`, `Expired` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Issued, payable until `expires_at`
    Pending,
    /// Settled
    Paid,
    /// Not paid before its deadline
    Expired,
    /// Rejected or cancelled by the provider
    Failed,
}

impl InvoiceStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parse from storage representation
    ///
    /// # Errors
    ///
    /// Returns [`ParseStatusError`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError {
                kind: "invoice",
                value: other.to_string(),
            }),
        }
    }

    /// Whether no further transitions are allowed
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a payment record. Payments are only written on settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Funds received
    Settled,
}

impl PaymentStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Settled => "settled",
        }
    }

    /// Parse from storage representation
    ///
    /// # Errors
    ///
    /// Returns [`ParseStatusError`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "settled" => Ok(Self::Settled),
            other => Err(ParseStatusError {
                kind: "payment",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Ledger Records
// ============================================================================

/// An event that sells a fixed number of tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID
    pub id: EventId,
    /// Display name
    pub name: String,
    /// Number of slots; never changes after creation
    pub capacity: u32,
    /// Price of one ticket
    pub price: Sats,
    /// Whether tickets are on sale
    pub is_active: bool,
    /// When the event was created
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new active event
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: u32, price: Sats, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            capacity,
            price,
            is_active: true,
            created_at,
        }
    }
}

/// A reserved slot for one user at one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket ID
    pub id: TicketId,
    /// Event the slot belongs to
    pub event_id: EventId,
    /// Buyer
    pub user_id: UserId,
    /// Unique printable code
    pub code: TicketCode,
    /// Current status
    pub status: TicketStatus,
    /// The current (most recent) invoice, if one was issued
    pub invoice_id: Option<InvoiceId>,
    /// When the slot was reserved
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Creates a new pending ticket without an invoice
    #[must_use]
    pub fn reserve(event_id: EventId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: TicketId::new(),
            event_id,
            user_id,
            code: TicketCode::generate(),
            status: TicketStatus::Pending,
            invoice_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A Lightning invoice issued for a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID
    pub id: InvoiceId,
    /// Ticket this invoice pays for
    pub ticket_id: TicketId,
    /// Amount requested
    pub amount: Sats,
    /// Description embedded in the invoice
    pub description: String,
    /// Encoded BOLT11 payment request
    pub bolt11: String,
    /// Hex payment hash (unique per invoice)
    pub payment_hash: String,
    /// Identifier the provider uses for status lookups
    pub provider_invoice_id: String,
    /// Current status
    pub status: InvoiceStatus,
    /// Payment deadline
    pub expires_at: DateTime<Utc>,
    /// When the invoice was issued
    pub created_at: DateTime<Utc>,
    /// When the invoice reached a terminal state
    pub settled_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Whether the deadline has passed at `now`
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Append-only record of a settled invoice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment ID
    pub id: PaymentId,
    /// Invoice that was settled
    pub invoice_id: InvoiceId,
    /// Amount received
    pub amount: Sats,
    /// Payment status
    pub status: PaymentStatus,
    /// When the payment was observed
    pub paid_at: DateTime<Utc>,
}

// ============================================================================
// Settlement Observations
// ============================================================================

/// Where a settlement observation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    /// Authoritative poll triggered by a provider push
    Push,
    /// Periodic poll
    Poll,
    /// Expiry sweeper
    Sweeper,
    /// Operator action
    Admin,
}

impl ObservationSource {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::Sweeper => "sweeper",
            Self::Admin => "admin",
        }
    }
}

/// One observed settlement status for one invoice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Invoice the observation is about
    pub invoice_id: InvoiceId,
    /// Status reported
    pub status: InvoiceStatus,
    /// Amount the provider reports as settled, if any
    pub settled_amount: Option<Sats>,
    /// When the status was observed
    pub observed_at: DateTime<Utc>,
    /// Channel it arrived through
    pub source: ObservationSource,
}

impl Observation {
    /// Creates an observation without a settled amount
    #[must_use]
    pub const fn new(
        invoice_id: InvoiceId,
        status: InvoiceStatus,
        observed_at: DateTime<Utc>,
        source: ObservationSource,
    ) -> Self {
        Self {
            invoice_id,
            status,
            settled_amount: None,
            observed_at,
            source,
        }
    }

    /// Attach the provider-reported settled amount
    #[must_use]
    pub const fn with_settled_amount(mut self, amount: Option<Sats>) -> Self {
        self.settled_amount = amount;
        self
    }
}
