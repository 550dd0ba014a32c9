//! Expiry sweeper, orphan reclaim and background task lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::harness;
use lnticket_core::ledger::Ledger;
use lnticket_core::provider::PushNotification;
use lnticket_core::types::{InvoiceStatus, Ticket, TicketStatus, UserId};
use lnticket_runtime::SweepReport;
use lnticket_testing::test_time;
use std::time::Duration;

#[tokio::test]
async fn test_unpaid_invoice_expires_after_ttl() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 0);

    h.advance_minutes(61);
    let report = h.engine.sweep_once().await;

    assert_eq!(
        report,
        SweepReport {
            expired: 1,
            ..SweepReport::default()
        }
    );
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Expired);
    assert_eq!(h.invoice(&invoice).await.status, InvoiceStatus::Expired);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_sweep_before_deadline_changes_nothing() {
    let h = harness(1).await;
    let (ticket, _) = h.purchase().await;

    h.advance_minutes(59);

    assert_eq!(h.engine.sweep_once().await, SweepReport::default());
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Pending);
    assert_eq!(h.provider.status_calls(), 0);
}

#[tokio::test]
async fn test_payment_racing_the_deadline_is_kept() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);

    h.advance_minutes(61);
    let report = h.engine.sweep_once().await;

    assert_eq!(report.paid, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Paid);
    assert_eq!(h.ledger.payment_count().await, 1);
}

#[tokio::test]
async fn test_unreachable_provider_still_expires() {
    let h = harness(2).await;
    let (first, _) = h.purchase().await;
    let (second, _) = h.purchase().await;
    h.provider.set_unreachable(true);

    h.advance_minutes(61);
    let report = h.engine.sweep_once().await;

    assert_eq!(report.expired, 2);
    assert_eq!(report.errors, 0);
    assert_eq!(h.ticket(&first).await.status, TicketStatus::Expired);
    assert_eq!(h.ticket(&second).await.status, TicketStatus::Expired);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_slow_provider_does_not_stall_the_sweep() {
    let h = harness(1).await;
    let (ticket, _) = h.purchase().await;
    h.provider.set_latency(Duration::from_secs(5));

    h.advance_minutes(61);
    let report = tokio::time::timeout(Duration::from_secs(3), h.engine.sweep_once())
        .await
        .unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Expired);
}

#[tokio::test]
async fn test_sweeping_twice_is_harmless() {
    let h = harness(1).await;
    h.purchase().await;
    h.advance_minutes(61);

    assert_eq!(h.engine.sweep_once().await.expired, 1);
    assert_eq!(h.engine.sweep_once().await, SweepReport::default());
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_orphaned_reservation_is_reclaimed_after_grace() {
    let h = harness(2).await;
    // A reservation whose invoice never made it to the ledger.
    let orphan = Ticket::reserve(h.event.id, UserId::new(), test_time());
    h.ledger.put_ticket(orphan.clone()).await;
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);

    h.advance_minutes(4);
    assert_eq!(h.engine.sweep_once().await.orphans_released, 0);

    h.advance_minutes(2);
    let report = h.engine.sweep_once().await;

    assert_eq!(report.orphans_released, 1);
    assert_eq!(h.ticket(&orphan).await.status, TicketStatus::Failed);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_ticket_with_live_invoice_is_not_an_orphan() {
    let h = harness(1).await;
    let (ticket, _) = h.purchase().await;

    h.advance_minutes(30);

    assert_eq!(h.engine.sweep_once().await.orphans_released, 0);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Pending);
}

#[tokio::test]
async fn test_started_engine_sweeps_and_shuts_down() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.advance_minutes(61);

    let running = h.engine.start();
    // The first tick fires immediately.
    let mut expired = false;
    for _ in 0..50 {
        if h.ledger.get_ticket(ticket.id).await.unwrap().unwrap().status == TicketStatus::Expired {
            expired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(expired);

    tokio::time::timeout(Duration::from_secs(5), running.shutdown())
        .await
        .unwrap();

    // With the mailboxes gone, pushes are logged and dropped.
    h.provider.mark_paid(&invoice.payment_hash);
    let outcome = h
        .engine
        .handle_push(PushNotification {
            payment_hash: invoice.payment_hash.clone(),
            status: "paid".to_string(),
        })
        .await;
    assert_eq!(outcome, None);
}
