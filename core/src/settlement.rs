//! Settlement state machine.
//!
//! Pure transition function for one invoice and its ticket. Given the
//! recorded state and one [`Observation`], the [`SettlementReducer`] updates
//! the state and returns the ledger writes the runtime must perform in the
//! same transaction.
//!
//! ```text
//!             ┌──────────► paid     (payment recorded, ticket paid)
//!   pending ──┼──────────► expired  (ticket expired, slot released)
//!             └──────────► failed   (ticket failed, slot released)
//! ```
//!
//! Terminal states never change. A repeated terminal observation is a
//! duplicate; a different one is a conflict that is reported and dropped.

use crate::reducer::Reducer;
use crate::types::{
    InvoiceId, InvoiceStatus, ObservationSource, Observation, Sats, TicketId, TicketStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

/// Recorded state of one invoice and its ticket, as loaded under lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementState {
    /// Invoice being settled
    pub invoice_id: InvoiceId,
    /// Ticket the invoice pays for
    pub ticket_id: TicketId,
    /// Amount the invoice asked for
    pub amount: Sats,
    /// Recorded invoice status
    pub invoice_status: InvoiceStatus,
    /// Recorded ticket status
    pub ticket_status: TicketStatus,
    /// Whether this invoice is the ticket's current one (not superseded by a retry)
    pub is_current_invoice: bool,
    /// Outcome of the most recent observation
    pub last_outcome: Option<SettlementOutcome>,
}

/// What a single observation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    /// First terminal transition
    Transitioned {
        /// Status before
        from: InvoiceStatus,
        /// Status after
        to: InvoiceStatus,
    },
    /// Same terminal status seen again
    Duplicate,
    /// Different status after a terminal one; dropped
    Conflict {
        /// Terminal status kept
        recorded: InvoiceStatus,
        /// Status that was dropped
        observed: InvoiceStatus,
    },
    /// Provider still reports pending
    StillPending,
    /// Paid for less than the invoice amount; left pending
    Underpaid,
}

/// Irregularities worth an operator's attention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementAnomaly {
    /// A different status arrived after a terminal one
    Conflicting {
        /// Terminal status kept
        recorded: InvoiceStatus,
        /// Status that was dropped
        observed: InvoiceStatus,
        /// Where the dropped observation came from
        source: ObservationSource,
    },
    /// Money arrived for an invoice whose slot is no longer held
    LateSettlement {
        /// Invoice status at the time
        recorded: InvoiceStatus,
        /// Ticket status at the time
        ticket_status: TicketStatus,
        /// Where the payment report came from
        source: ObservationSource,
    },
    /// Settled amount below the invoice amount
    Underpaid {
        /// Amount requested
        expected: Sats,
        /// Amount the provider reported
        settled: Sats,
    },
}

impl SettlementAnomaly {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conflicting { .. } => "conflicting",
            Self::LateSettlement { .. } => "late_settlement",
            Self::Underpaid { .. } => "underpaid",
        }
    }

    /// Whether money may have been received without a ticket being issued
    #[must_use]
    pub const fn needs_operator(&self) -> bool {
        matches!(self, Self::LateSettlement { .. } | Self::Underpaid { .. })
    }
}

/// Ledger writes requested by the reducer, executed in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementEffect {
    /// Set the invoice status
    MarkInvoice {
        /// New status
        status: InvoiceStatus,
        /// Observation time
        at: DateTime<Utc>,
    },
    /// Append the payment record
    RecordPayment {
        /// Amount received
        amount: Sats,
        /// Observation time
        paid_at: DateTime<Utc>,
    },
    /// Set the ticket status without touching inventory
    MarkTicket {
        /// New status
        status: TicketStatus,
        /// Observation time
        at: DateTime<Utc>,
    },
    /// Move the ticket to `status` and give its slot back
    ReleaseSlot {
        /// Non-live status to record on the ticket
        status: TicketStatus,
        /// Observation time
        at: DateTime<Utc>,
    },
    /// Report an anomaly; no ledger write
    Anomaly(SettlementAnomaly),
}

/// Tunables for the settlement reducer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPolicy {
    /// Accept a `paid` report whose settled amount is below the invoice amount
    pub allow_underpayment: bool,
}

/// Reducer implementing the invoice settlement state machine.
#[derive(Clone, Debug, Default)]
pub struct SettlementReducer;

impl SettlementReducer {
    /// Creates a new `SettlementReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn settle_paid(
        state: &mut SettlementState,
        observation: &Observation,
        policy: &SettlementPolicy,
    ) -> SmallVec<[SettlementEffect; 4]> {
        let settled = observation.settled_amount.unwrap_or(state.amount);
        if settled < state.amount && !policy.allow_underpayment {
            state.last_outcome = Some(SettlementOutcome::Underpaid);
            return smallvec![SettlementEffect::Anomaly(SettlementAnomaly::Underpaid {
                expected: state.amount,
                settled,
            })];
        }

        let from = state.invoice_status;
        state.invoice_status = InvoiceStatus::Paid;
        state.last_outcome = Some(SettlementOutcome::Transitioned {
            from,
            to: InvoiceStatus::Paid,
        });

        let mut effects: SmallVec<[SettlementEffect; 4]> = smallvec![
            SettlementEffect::MarkInvoice {
                status: InvoiceStatus::Paid,
                at: observation.observed_at,
            },
            SettlementEffect::RecordPayment {
                amount: settled,
                paid_at: observation.observed_at,
            },
        ];

        if state.is_current_invoice && state.ticket_status == TicketStatus::Pending {
            state.ticket_status = TicketStatus::Paid;
            effects.push(SettlementEffect::MarkTicket {
                status: TicketStatus::Paid,
                at: observation.observed_at,
            });
        } else {
            // Payment recorded for audit, but no slot is held for it.
            effects.push(SettlementEffect::Anomaly(SettlementAnomaly::LateSettlement {
                recorded: from,
                ticket_status: state.ticket_status,
                source: observation.source,
            }));
        }

        effects
    }

    fn settle_unpaid(
        state: &mut SettlementState,
        observation: &Observation,
    ) -> SmallVec<[SettlementEffect; 4]> {
        let from = state.invoice_status;
        state.invoice_status = observation.status;
        state.last_outcome = Some(SettlementOutcome::Transitioned {
            from,
            to: observation.status,
        });

        let mut effects: SmallVec<[SettlementEffect; 4]> = smallvec![SettlementEffect::MarkInvoice {
            status: observation.status,
            at: observation.observed_at,
        }];

        if state.is_current_invoice && state.ticket_status == TicketStatus::Pending {
            let ticket_status = TicketStatus::from(observation.status);
            state.ticket_status = ticket_status;
            effects.push(SettlementEffect::ReleaseSlot {
                status: ticket_status,
                at: observation.observed_at,
            });
        }

        effects
    }
}

impl Reducer for SettlementReducer {
    type State = SettlementState;
    type Action = Observation;
    type Environment = SettlementPolicy;
    type Effect = SettlementEffect;

    fn reduce(
        &self,
        state: &mut Self::State,
        observation: Self::Action,
        policy: &Self::Environment,
    ) -> SmallVec<[Self::Effect; 4]> {
        let recorded = state.invoice_status;

        if recorded.is_terminal() {
            if observation.status == recorded {
                state.last_outcome = Some(SettlementOutcome::Duplicate);
                return SmallVec::new();
            }

            state.last_outcome = Some(SettlementOutcome::Conflict {
                recorded,
                observed: observation.status,
            });

            let mut effects: SmallVec<[SettlementEffect; 4]> =
                smallvec![SettlementEffect::Anomaly(SettlementAnomaly::Conflicting {
                    recorded,
                    observed: observation.status,
                    source: observation.source,
                })];
            if observation.status == InvoiceStatus::Paid {
                effects.push(SettlementEffect::Anomaly(SettlementAnomaly::LateSettlement {
                    recorded,
                    ticket_status: state.ticket_status,
                    source: observation.source,
                }));
            }
            return effects;
        }

        match observation.status {
            InvoiceStatus::Pending => {
                state.last_outcome = Some(SettlementOutcome::StillPending);
                SmallVec::new()
            }
            InvoiceStatus::Paid => Self::settle_paid(state, &observation, policy),
            InvoiceStatus::Expired | InvoiceStatus::Failed => {
                Self::settle_unpaid(state, &observation)
            }
        }
    }
}
