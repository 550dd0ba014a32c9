//! Settlement through push, poll and direct observations.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{PRICE, harness, harness_with, test_config};
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::{ProviderStatus, PushNotification};
use lnticket_core::settlement::SettlementOutcome;
use lnticket_core::types::{InvoiceStatus, Observation, ObservationSource, Sats, TicketStatus};

fn push(payment_hash: &str) -> PushNotification {
    PushNotification {
        payment_hash: payment_hash.to_string(),
        status: "paid".to_string(),
    }
}

const PAID: Option<SettlementOutcome> = Some(SettlementOutcome::Transitioned {
    from: InvoiceStatus::Pending,
    to: InvoiceStatus::Paid,
});

#[tokio::test]
async fn test_push_triggers_authoritative_poll() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);

    let outcome = h.engine.handle_push(push(&invoice.payment_hash)).await;

    assert_eq!(outcome, PAID);
    assert_eq!(h.provider.status_calls(), 1);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    let stored = h.invoice(&invoice).await;
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert!(stored.settled_at.is_some());
    let payment = h
        .ledger
        .payment_for_invoice(invoice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, Sats::new(PRICE));
}

#[tokio::test]
async fn test_push_claim_is_not_trusted() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;

    // Provider still reports the invoice unpaid.
    let outcome = h.engine.handle_push(push(&invoice.payment_hash)).await;

    assert_eq!(outcome, Some(SettlementOutcome::StillPending));
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Pending);
    assert_eq!(h.ledger.payment_count().await, 0);
}

#[tokio::test]
async fn test_push_for_unknown_hash_is_ignored() {
    let h = harness(1).await;

    assert_eq!(h.engine.handle_push(push(&"ff".repeat(32))).await, None);
    assert_eq!(h.provider.status_calls(), 0);
}

#[tokio::test]
async fn test_repeated_paid_is_idempotent() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);

    let first = h.engine.handle_push(push(&invoice.payment_hash)).await;
    let second = h
        .engine
        .apply_observation(Observation::new(
            invoice.id,
            InvoiceStatus::Paid,
            h.clock_now(),
            ObservationSource::Poll,
        ))
        .await
        .unwrap();
    let third = h.engine.handle_push(push(&invoice.payment_hash)).await;

    assert_eq!(first, PAID);
    assert_eq!(second, Some(SettlementOutcome::Duplicate));
    assert_eq!(third, Some(SettlementOutcome::Duplicate));
    assert_eq!(h.ledger.payment_count().await, 1);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    // A settled invoice is never polled again.
    assert_eq!(h.engine.poll_once().await.polled, 0);
}

#[tokio::test]
async fn test_paid_then_stray_expired_keeps_paid() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;

    h.advance_minutes(10);
    h.provider.mark_paid(&invoice.payment_hash);
    assert_eq!(h.engine.handle_push(push(&invoice.payment_hash)).await, PAID);

    h.advance_minutes(5);
    let stray = h
        .engine
        .apply_observation(Observation::new(
            invoice.id,
            InvoiceStatus::Expired,
            h.clock_now(),
            ObservationSource::Poll,
        ))
        .await
        .unwrap();

    assert_eq!(
        stray,
        Some(SettlementOutcome::Conflict {
            recorded: InvoiceStatus::Paid,
            observed: InvoiceStatus::Expired,
        })
    );
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    assert_eq!(h.invoice(&invoice).await.status, InvoiceStatus::Paid);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_after_paid_is_dropped() {
    let h = harness(2).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);
    h.engine.poll_once().await;

    let outcome = h
        .engine
        .apply_observation(Observation::new(
            invoice.id,
            InvoiceStatus::Failed,
            h.clock_now(),
            ObservationSource::Admin,
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, Some(SettlementOutcome::Conflict { .. })));
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_poll_settles_and_releases() {
    let h = harness(3).await;
    let (paid_ticket, paid) = h.purchase().await;
    let (failed_ticket, failed) = h.purchase().await;
    let (open_ticket, _) = h.purchase().await;
    h.provider.mark_paid(&paid.payment_hash);
    h.provider.set_status(
        &failed.payment_hash,
        ProviderStatus {
            status: InvoiceStatus::Failed,
            settled_amount: None,
        },
    );

    let report = h.engine.poll_once().await;

    assert_eq!(report.polled, 3);
    assert_eq!(report.settled, 2);
    assert_eq!(report.errors, 0);
    assert_eq!(h.ticket(&paid_ticket).await.status, TicketStatus::Paid);
    assert_eq!(h.ticket(&failed_ticket).await.status, TicketStatus::Failed);
    assert_eq!(h.ticket(&open_ticket).await.status, TicketStatus::Pending);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_poll_survives_provider_outage() {
    let h = harness(1).await;
    let (ticket, _) = h.purchase().await;
    h.provider.set_unreachable(true);

    let report = h.engine.poll_once().await;

    assert_eq!(report.polled, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Pending);

    h.provider.set_unreachable(false);
    assert_eq!(h.engine.poll_once().await.errors, 0);
}

#[tokio::test]
async fn test_poll_retries_transient_status_errors() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);
    h.provider.fail_next_status(1);

    let report = h.engine.poll_once().await;

    assert_eq!(report.settled, 1);
    assert_eq!(h.provider.status_calls(), 2);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
}

#[tokio::test]
async fn test_underpayment_is_held_pending() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider
        .set_status(&invoice.payment_hash, ProviderStatus::paid(Sats::new(PRICE - 1)));

    let outcome = h.engine.handle_push(push(&invoice.payment_hash)).await;

    assert_eq!(outcome, Some(SettlementOutcome::Underpaid));
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Pending);
    assert_eq!(h.invoice(&invoice).await.status, InvoiceStatus::Pending);
    assert_eq!(h.ledger.payment_count().await, 0);
}

#[tokio::test]
async fn test_underpayment_accepted_when_allowed() {
    let mut config = test_config();
    config.reconciler.policy.allow_underpayment = true;
    let h = harness_with(1, config).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider
        .set_status(&invoice.payment_hash, ProviderStatus::paid(Sats::new(PRICE - 100)));

    assert_eq!(h.engine.handle_push(push(&invoice.payment_hash)).await, PAID);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    let payment = h
        .ledger
        .payment_for_invoice(invoice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, Sats::new(PRICE - 100));
}

#[tokio::test]
async fn test_late_payment_after_expiry_is_flagged_not_applied() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.advance_minutes(61);
    h.engine.sweep_once().await;
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Expired);

    h.provider.mark_paid(&invoice.payment_hash);
    let outcome = h.engine.handle_push(push(&invoice.payment_hash)).await;

    assert_eq!(
        outcome,
        Some(SettlementOutcome::Conflict {
            recorded: InvoiceStatus::Expired,
            observed: InvoiceStatus::Paid,
        })
    );
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Expired);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_started_engine_settles_through_background_poll() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);

    let running = h.engine.start();
    // The poller's first tick fires immediately.
    let mut paid = false;
    for _ in 0..50 {
        if h.ticket(&ticket).await.status == TicketStatus::Paid {
            paid = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    tokio::time::timeout(std::time::Duration::from_secs(5), running.shutdown())
        .await
        .unwrap();

    assert!(paid);
    assert!(h.ledger.payment_for_invoice(invoice.id).await.unwrap().is_some());
}
