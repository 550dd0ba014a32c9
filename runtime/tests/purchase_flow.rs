//! Purchase, invoice access and administrative retry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PRICE, harness};
use lnticket_core::ledger::{Ledger, LedgerResult, LedgerTx};
use lnticket_core::types::{
    Event, EventId, Invoice, InvoiceId, InvoiceStatus, Payment, Sats, Ticket, TicketId,
    TicketStatus, UserId,
};
use lnticket_core::{LedgerError, TicketingError};
use lnticket_runtime::TicketingEngine;
use lnticket_testing::{InMemoryLedger, MockPaymentProvider, test_clock};
use std::sync::Arc;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_purchase_returns_linked_ticket_and_invoice() {
    let h = harness(5).await;

    let (ticket, invoice) = h.purchase().await;

    assert_eq!(ticket.status, TicketStatus::Pending);
    assert_eq!(ticket.invoice_id, Some(invoice.id));
    assert_eq!(invoice.ticket_id, ticket.id);
    assert_eq!(invoice.amount, Sats::new(PRICE));
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert!(invoice.description.contains(ticket.code.as_str()));
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 4);
    assert_eq!(
        h.engine.get_ticket_status(ticket.id).await.unwrap(),
        TicketStatus::Pending
    );
    assert_eq!(h.engine.current_invoice(ticket.id).await.unwrap(), invoice);
}

#[tokio::test]
async fn test_two_buyers_for_last_slot_one_wins() {
    let h = harness(1).await;

    let (a, b) = tokio::join!(
        h.engine.purchase_ticket(h.event.id, UserId::new()),
        h.engine.purchase_ticket(h.event.id, UserId::new()),
    );

    let (ok, err): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
    assert_eq!(ok.len(), 1);
    assert_eq!(
        err.into_iter().next().unwrap().unwrap_err(),
        TicketingError::CapacityExceeded {
            event_id: h.event.id
        }
    );
    assert_eq!(h.ledger.tickets_for_event(h.event.id).await.len(), 1);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_provider_outage_releases_slot_and_fabricates_nothing() {
    let h = harness(1).await;
    h.provider.fail_next_creates(1);

    let err = h
        .engine
        .purchase_ticket(h.event.id, UserId::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TicketingError::PaymentProviderUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
    let tickets = h.ledger.tickets_for_event(h.event.id).await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, TicketStatus::Failed);
    assert!(tickets[0].invoice_id.is_none());

    // The buyer can simply try again.
    assert_ok!(h.engine.purchase_ticket(h.event.id, UserId::new()).await);
}

#[tokio::test]
async fn test_unreachable_provider_never_consumes_capacity() {
    let h = harness(3).await;
    h.provider.set_unreachable(true);

    for _ in 0..2 {
        let err = h
            .engine
            .purchase_ticket(h.event.id, UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TicketingError::PaymentProviderUnavailable(_)));
    }
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_inactive_event_is_refused() {
    let h = harness(3).await;
    let mut closed = lnticket_testing::helpers::event(3, PRICE);
    closed.is_active = false;
    h.ledger.insert_event(&closed).await.unwrap();

    let err = h
        .engine
        .purchase_ticket(closed.id, UserId::new())
        .await
        .unwrap_err();
    assert_eq!(err, TicketingError::EventInactive(closed.id));
    assert_eq!(err.public_message(), "Tickets for this event are not on sale");
    assert_eq!(h.provider.create_calls(), 0);
}

#[tokio::test]
async fn test_current_invoice_past_deadline_is_expired() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;

    h.advance_minutes(61);

    assert_eq!(
        h.engine.current_invoice(ticket.id).await.unwrap_err(),
        TicketingError::InvoiceExpired {
            invoice_id: invoice.id
        }
    );
}

#[tokio::test]
async fn test_retry_after_expiry_issues_fresh_invoice_and_keeps_old() {
    let h = harness(1).await;
    let (ticket, old) = h.purchase().await;
    h.advance_minutes(61);
    let report = h.engine.sweep_once().await;
    assert_eq!(report.expired, 1);
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Expired);

    let fresh = h.engine.admin_retry_payment(ticket.id).await.unwrap();

    assert_ne!(fresh.id, old.id);
    assert_ne!(fresh.payment_hash, old.payment_hash);
    assert_eq!(fresh.status, InvoiceStatus::Pending);
    let stored = h.ticket(&ticket).await;
    assert_eq!(stored.status, TicketStatus::Pending);
    assert_eq!(stored.invoice_id, Some(fresh.id));

    let audit = h.invoice(&old).await;
    assert_eq!(audit.status, InvoiceStatus::Expired);
    assert_eq!(audit.bolt11, old.bolt11);
    assert_eq!(
        h.ledger.invoices_for_ticket(ticket.id).await.unwrap().len(),
        2
    );
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 0);
    assert_eq!(h.engine.current_invoice(ticket.id).await.unwrap(), fresh);
}

#[tokio::test]
async fn test_retry_refused_for_paid_ticket() {
    let h = harness(1).await;
    let (ticket, invoice) = h.purchase().await;
    h.provider.mark_paid(&invoice.payment_hash);
    h.engine.poll_once().await;

    let err = h.engine.admin_retry_payment(ticket.id).await.unwrap_err();

    assert!(matches!(
        err,
        TicketingError::InvalidStateTransition {
            ticket_status: TicketStatus::Paid,
            invoice_status: Some(InvoiceStatus::Paid),
            ..
        }
    ));
    assert_eq!(err.public_message(), "Internal error");
    assert_eq!(h.provider.create_calls(), 1);
}

#[tokio::test]
async fn test_retry_with_provider_down_releases_slot_again() {
    let h = harness(1).await;
    let (ticket, _) = h.purchase().await;
    h.advance_minutes(61);
    h.engine.sweep_once().await;
    h.provider.fail_next_creates(1);

    let err = h.engine.admin_retry_payment(ticket.id).await.unwrap_err();

    assert!(matches!(err, TicketingError::PaymentProviderUnavailable(_)));
    assert_eq!(h.ticket(&ticket).await.status, TicketStatus::Failed);
    assert_eq!(h.engine.remaining_capacity(h.event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_ticket() {
    let h = harness(1).await;
    let missing = lnticket_core::types::TicketId::new();

    assert_eq!(
        h.engine.get_ticket_status(missing).await.unwrap_err(),
        TicketingError::TicketNotFound(missing)
    );
    assert_eq!(
        h.engine.admin_retry_payment(missing).await.unwrap_err(),
        TicketingError::TicketNotFound(missing)
    );
}

/// Delegates to an in-memory ledger but fails every standalone event read.
struct EventReadsDown(InMemoryLedger);

#[async_trait]
impl Ledger for EventReadsDown {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        self.0.begin().await
    }
    async fn insert_event(&self, event: &Event) -> LedgerResult<()> {
        self.0.insert_event(event).await
    }
    async fn get_event(&self, _event_id: EventId) -> LedgerResult<Option<Event>> {
        Err(LedgerError::Database("connection reset".into()))
    }
    async fn live_ticket_count(&self, event_id: EventId) -> LedgerResult<u32> {
        self.0.live_ticket_count(event_id).await
    }
    async fn get_ticket(&self, ticket_id: TicketId) -> LedgerResult<Option<Ticket>> {
        self.0.get_ticket(ticket_id).await
    }
    async fn get_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        self.0.get_invoice(invoice_id).await
    }
    async fn find_invoice_by_payment_hash(&self, hash: &str) -> LedgerResult<Option<Invoice>> {
        self.0.find_invoice_by_payment_hash(hash).await
    }
    async fn invoices_for_ticket(&self, ticket_id: TicketId) -> LedgerResult<Vec<Invoice>> {
        self.0.invoices_for_ticket(ticket_id).await
    }
    async fn payment_for_invoice(&self, invoice_id: InvoiceId) -> LedgerResult<Option<Payment>> {
        self.0.payment_for_invoice(invoice_id).await
    }
    async fn pending_invoices(&self, limit: usize) -> LedgerResult<Vec<Invoice>> {
        self.0.pending_invoices(limit).await
    }
    async fn expired_pending_invoices(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Invoice>> {
        self.0.expired_pending_invoices(now, limit).await
    }
    async fn orphaned_pending_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Ticket>> {
        self.0.orphaned_pending_tickets(updated_before, limit).await
    }
}

#[tokio::test]
async fn test_purchase_prices_invoice_from_reservation_read() {
    let ledger = InMemoryLedger::new();
    let event = lnticket_testing::helpers::event(1, PRICE);
    ledger.insert_event(&event).await.unwrap();
    let engine = TicketingEngine::new(
        Arc::new(EventReadsDown(ledger.clone())),
        Arc::new(MockPaymentProvider::new()),
        Arc::new(test_clock()),
        common::test_config(),
    );

    let (ticket, invoice) = engine
        .purchase_ticket(event.id, UserId::new())
        .await
        .unwrap();

    assert_eq!(invoice.amount, Sats::new(PRICE));
    assert!(invoice.description.starts_with(&event.name));
    let tickets = ledger.tickets_for_event(event.id).await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].id, ticket.id);
    assert_eq!(tickets[0].invoice_id, Some(invoice.id));
    assert_eq!(
        engine.purchase_ticket(event.id, UserId::new()).await.unwrap_err(),
        TicketingError::CapacityExceeded { event_id: event.id }
    );
}
