//! Settlement reducer behaviour: idempotence, monotonicity, and the
//! push/poll race.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use lnticket_core::reducer::Reducer;
use lnticket_core::settlement::{
    SettlementAnomaly, SettlementEffect, SettlementOutcome, SettlementPolicy, SettlementReducer,
    SettlementState,
};
use lnticket_core::types::{
    InvoiceId, InvoiceStatus, Observation, ObservationSource, Sats, TicketId, TicketStatus,
};
use lnticket_testing::reducer_test::assertions;
use lnticket_testing::{ReducerTest, properties, test_time};
use proptest::prelude::*;

fn pending_state() -> SettlementState {
    SettlementState {
        invoice_id: InvoiceId::new(),
        ticket_id: TicketId::new(),
        amount: Sats::new(2_100),
        invoice_status: InvoiceStatus::Pending,
        ticket_status: TicketStatus::Pending,
        is_current_invoice: true,
        last_outcome: None,
    }
}

fn observation(
    state: &SettlementState,
    status: InvoiceStatus,
    minutes: i64,
    source: ObservationSource,
) -> Observation {
    Observation::new(
        state.invoice_id,
        status,
        test_time() + Duration::minutes(minutes),
        source,
    )
}

#[test]
fn test_first_paid_transitions_invoice_and_ticket() {
    let state = pending_state();
    let paid = observation(&state, InvoiceStatus::Paid, 5, ObservationSource::Push);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(paid)
        .then_state(|s| {
            assert_eq!(s.invoice_status, InvoiceStatus::Paid);
            assert_eq!(s.ticket_status, TicketStatus::Paid);
            assert_eq!(
                s.last_outcome,
                Some(SettlementOutcome::Transitioned {
                    from: InvoiceStatus::Pending,
                    to: InvoiceStatus::Paid,
                })
            );
        })
        .then_effects(|effects| {
            assert!(matches!(
                effects,
                [
                    SettlementEffect::MarkInvoice { status: InvoiceStatus::Paid, .. },
                    SettlementEffect::RecordPayment { .. },
                    SettlementEffect::MarkTicket { status: TicketStatus::Paid, .. },
                ]
            ));
        })
        .run();
}

#[test]
fn test_repeated_paid_is_idempotent() {
    let state = pending_state();
    let first = observation(&state, InvoiceStatus::Paid, 1, ObservationSource::Push);
    let second = observation(&state, InvoiceStatus::Paid, 2, ObservationSource::Poll);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(first)
        .when_action(second)
        .then_state(|s| {
            assert_eq!(s.invoice_status, InvoiceStatus::Paid);
            assert_eq!(s.last_outcome, Some(SettlementOutcome::Duplicate));
        })
        .then_effects(assertions::assert_no_effects)
        .run();
}

// Push-triggered paid at 10 min, stray poll reporting expired at 15 min.
#[test]
fn test_expired_after_paid_is_dropped_as_conflict() {
    let state = pending_state();
    let paid = observation(&state, InvoiceStatus::Paid, 10, ObservationSource::Push);
    let expired = observation(&state, InvoiceStatus::Expired, 15, ObservationSource::Poll);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(paid)
        .when_action(expired)
        .then_state(|s| {
            assert_eq!(s.invoice_status, InvoiceStatus::Paid);
            assert_eq!(s.ticket_status, TicketStatus::Paid);
        })
        .then_effects(|effects| {
            assert_eq!(
                effects,
                [SettlementEffect::Anomaly(SettlementAnomaly::Conflicting {
                    recorded: InvoiceStatus::Paid,
                    observed: InvoiceStatus::Expired,
                    source: ObservationSource::Poll,
                })]
            );
        })
        .run();
}

#[test]
fn test_paid_after_expiry_is_late_settlement() {
    let state = pending_state();
    let expired = observation(&state, InvoiceStatus::Expired, 61, ObservationSource::Sweeper);
    let paid = observation(&state, InvoiceStatus::Paid, 62, ObservationSource::Push);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(expired)
        .when_action(paid)
        .then_state(|s| {
            assert_eq!(s.invoice_status, InvoiceStatus::Expired);
            assert_eq!(s.ticket_status, TicketStatus::Expired);
        })
        .then_effects(|effects| {
            assert_eq!(effects.len(), 2);
            assert!(effects.iter().any(|e| matches!(
                e,
                SettlementEffect::Anomaly(a) if a.kind() == "late_settlement" && a.needs_operator()
            )));
        })
        .run();
}

#[test]
fn test_failed_releases_slot_as_failed() {
    let state = pending_state();
    let failed = observation(&state, InvoiceStatus::Failed, 3, ObservationSource::Poll);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(failed)
        .then_state(|s| assert_eq!(s.ticket_status, TicketStatus::Failed))
        .then_effects(|effects| {
            assert!(matches!(
                effects.last(),
                Some(SettlementEffect::ReleaseSlot { status: TicketStatus::Failed, .. })
            ));
        })
        .run();
}

#[test]
fn test_paid_on_superseded_invoice_records_payment_only() {
    let mut state = pending_state();
    state.is_current_invoice = false;
    let paid = observation(&state, InvoiceStatus::Paid, 20, ObservationSource::Poll);

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy::default())
        .given_state(state)
        .when_action(paid)
        .then_state(|s| {
            assert_eq!(s.invoice_status, InvoiceStatus::Paid);
            assert_eq!(s.ticket_status, TicketStatus::Pending);
        })
        .then_effects(|effects| {
            assert!(effects.iter().any(|e| matches!(e, SettlementEffect::RecordPayment { .. })));
            assert!(!effects.iter().any(|e| matches!(e, SettlementEffect::MarkTicket { .. })));
        })
        .run();
}

#[test]
fn test_underpayment_allowed_by_policy() {
    let state = pending_state();
    let paid = observation(&state, InvoiceStatus::Paid, 1, ObservationSource::Poll)
        .with_settled_amount(Some(Sats::new(2_000)));

    ReducerTest::new(SettlementReducer::new())
        .with_env(SettlementPolicy {
            allow_underpayment: true,
        })
        .given_state(state)
        .when_action(paid)
        .then_state(|s| assert_eq!(s.invoice_status, InvoiceStatus::Paid))
        .then_effects(|effects| {
            assert!(effects.contains(&SettlementEffect::RecordPayment {
                amount: Sats::new(2_000),
                paid_at: test_time() + Duration::minutes(1),
            }));
        })
        .run();
}

proptest! {
    // The first terminal status observed is the one that sticks, and at most
    // one payment is ever recorded.
    #[test]
    fn prop_first_terminal_status_wins(sequence in properties::observation_sequence(12)) {
        let reducer = SettlementReducer::new();
        let policy = SettlementPolicy::default();
        let mut state = pending_state();
        let mut payments = 0;
        let mut slot_releases = 0;

        for (minute, (status, source)) in (0_i64..).zip(sequence.iter().copied()) {
            let obs = observation(&state, status, minute, source);
            for effect in reducer.reduce(&mut state, obs, &policy) {
                match effect {
                    SettlementEffect::RecordPayment { .. } => payments += 1,
                    SettlementEffect::ReleaseSlot { .. } => slot_releases += 1,
                    _ => {}
                }
            }
        }

        let first_terminal = sequence.iter().map(|(s, _)| *s).find(InvoiceStatus::is_terminal);
        match first_terminal {
            Some(expected) => {
                prop_assert_eq!(state.invoice_status, expected);
                prop_assert_eq!(state.ticket_status, TicketStatus::from(expected));
            }
            None => {
                prop_assert_eq!(state.invoice_status, InvoiceStatus::Pending);
                prop_assert_eq!(state.ticket_status, TicketStatus::Pending);
            }
        }
        prop_assert!(payments <= 1);
        prop_assert!(slot_releases <= 1);
        prop_assert!(payments + slot_releases <= 1);
    }
}
