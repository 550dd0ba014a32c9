//! Inventory allocator.
//!
//! Reserves and releases capacity slots. A slot is held by every live
//! ticket (pending or paid), so capacity is never stored separately: it is
//! `event.capacity - live_ticket_count`, read under the event row lock.

use crate::config::AllocatorConfig;
use crate::metrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use lnticket_core::environment::Clock;
use lnticket_core::ledger::{Ledger, LedgerTx};
use lnticket_core::types::{Event, EventId, Ticket, TicketId, TicketStatus, UserId};
use lnticket_core::{Result, TicketingError};
use std::sync::Arc;

/// Reserves and releases capacity slots.
pub struct InventoryAllocator {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl InventoryAllocator {
    /// Creates a new `InventoryAllocator`
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, config: &AllocatorConfig) -> Self {
        Self {
            ledger,
            clock,
            retry: RetryPolicy::with_max_retries(config.max_conflict_retries),
        }
    }

    /// Reserve one slot and create its pending ticket.
    ///
    /// The capacity check and the insert happen in one transaction holding
    /// the event row lock, so concurrent reservations for the same event are
    /// serialized. Write conflicts and lock timeouts are retried with backoff.
    /// The event is returned as read under that lock.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::CapacityExceeded`] if every slot is taken
    /// - [`TicketingError::EventNotFound`] / [`TicketingError::EventInactive`]
    /// - [`TicketingError::Transient`] if retries are exhausted
    #[tracing::instrument(skip(self), fields(event_id = %event_id))]
    pub async fn reserve_slot(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(Ticket, Event)> {
        let result = retry_with_predicate(
            self.retry.clone(),
            || self.try_reserve(event_id, user_id),
            |err: &TicketingError| matches!(err, TicketingError::Transient(_)),
        )
        .await;

        match &result {
            Ok((ticket, _)) => {
                metrics::record_reservation("reserved");
                tracing::debug!(ticket_id = %ticket.id, code = %ticket.code, "Slot reserved");
            }
            Err(TicketingError::CapacityExceeded { .. }) => {
                metrics::record_reservation("capacity_exceeded");
                tracing::info!("Reservation refused: sold out");
            }
            Err(err) => {
                metrics::record_reservation("error");
                tracing::warn!(error = %err, "Reservation failed");
            }
        }
        result
    }

    async fn try_reserve(&self, event_id: EventId, user_id: UserId) -> Result<(Ticket, Event)> {
        let mut tx = self.ledger.begin().await?;
        let ticket = Ticket::reserve(event_id, user_id, self.clock.now());
        let event = Self::claim_slot(tx.as_mut(), event_id).await?;
        tx.insert_ticket(&ticket).await?;
        tx.commit().await?;
        Ok((ticket, event))
    }

    /// Lock the event and check that one more slot is free.
    async fn claim_slot(tx: &mut dyn LedgerTx, event_id: EventId) -> Result<Event> {
        let event = tx
            .lock_event(event_id)
            .await?
            .ok_or(TicketingError::EventNotFound(event_id))?;
        if !event.is_active {
            return Err(TicketingError::EventInactive(event_id));
        }
        let live = tx.live_ticket_count(event_id).await?;
        if live >= event.capacity {
            return Err(TicketingError::CapacityExceeded { event_id });
        }
        Ok(event)
    }

    /// Put a released ticket back into `pending`, taking a slot again.
    ///
    /// The caller must already hold the ticket lock; this takes the event
    /// lock next, keeping the ticket → event order. Returns the event so the
    /// caller can price the new invoice.
    ///
    /// # Errors
    ///
    /// [`TicketingError::CapacityExceeded`] if the event sold out meanwhile,
    /// [`TicketingError::InvalidStateTransition`] if the ticket is live.
    pub async fn readmit_in_tx(
        tx: &mut dyn LedgerTx,
        ticket: &Ticket,
        at: DateTime<Utc>,
    ) -> Result<Event> {
        if ticket.status.is_live() {
            return Err(TicketingError::InvalidStateTransition {
                ticket_id: ticket.id,
                ticket_status: ticket.status,
                invoice_status: None,
            });
        }
        let event = Self::claim_slot(tx, ticket.event_id).await?;
        tx.update_ticket_status(ticket.id, TicketStatus::Pending, at)
            .await?;
        Ok(event)
    }

    /// Release the slot held by a pending ticket, in its own transaction.
    ///
    /// Returns `false` when there was nothing to release.
    ///
    /// # Errors
    ///
    /// [`TicketingError::TicketNotFound`] for an unknown ticket, or a ledger
    /// error.
    pub async fn release_slot(&self, ticket_id: TicketId, status: TicketStatus) -> Result<bool> {
        let mut tx = self.ledger.begin().await?;
        let released = Self::release_in_tx(tx.as_mut(), ticket_id, status, self.clock.now()).await?;
        tx.commit().await?;
        Ok(released)
    }

    /// Release the slot held by a pending ticket inside the caller's
    /// transaction.
    ///
    /// Idempotent: a ticket that is already paid, expired or failed is left
    /// alone and `false` is returned. `status` must be a non-live status.
    ///
    /// # Errors
    ///
    /// [`TicketingError::TicketNotFound`] for an unknown ticket,
    /// [`TicketingError::InvalidStateTransition`] if `status` is live.
    pub async fn release_in_tx(
        tx: &mut dyn LedgerTx,
        ticket_id: TicketId,
        status: TicketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let ticket = tx
            .lock_ticket(ticket_id)
            .await?
            .ok_or(TicketingError::TicketNotFound(ticket_id))?;

        if status.is_live() {
            return Err(TicketingError::InvalidStateTransition {
                ticket_id,
                ticket_status: ticket.status,
                invoice_status: None,
            });
        }
        if ticket.status != TicketStatus::Pending {
            tracing::debug!(ticket_id = %ticket_id, status = %ticket.status, "Nothing to release");
            return Ok(false);
        }

        tx.update_ticket_status(ticket_id, status, at).await?;
        tracing::debug!(ticket_id = %ticket_id, status = %status, "Slot released");
        Ok(true)
    }

    /// Slots still available for an event.
    ///
    /// # Errors
    ///
    /// [`TicketingError::EventNotFound`] for an unknown event.
    pub async fn remaining_capacity(&self, event_id: EventId) -> Result<u32> {
        let event = self
            .ledger
            .get_event(event_id)
            .await?
            .ok_or(TicketingError::EventNotFound(event_id))?;
        let live = self.ledger.live_ticket_count(event_id).await?;
        Ok(event.capacity.saturating_sub(live))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lnticket_testing::helpers::event;
    use lnticket_testing::{InMemoryLedger, test_clock};

    fn allocator(ledger: &InMemoryLedger) -> InventoryAllocator {
        InventoryAllocator::new(
            Arc::new(ledger.clone()),
            Arc::new(test_clock()),
            &AllocatorConfig {
                max_conflict_retries: 2,
                lock_timeout_ms: 100,
            },
        )
    }

    #[tokio::test]
    async fn test_reserve_then_release_restores_capacity() {
        let ledger = InMemoryLedger::new();
        let event = event(3, 1_000);
        ledger.insert_event(&event).await.unwrap();
        let allocator = allocator(&ledger);

        let (ticket, _) = allocator.reserve_slot(event.id, UserId::new()).await.unwrap();
        assert_eq!(allocator.remaining_capacity(event.id).await.unwrap(), 2);

        assert!(allocator.release_slot(ticket.id, TicketStatus::Failed).await.unwrap());
        assert_eq!(allocator.remaining_capacity(event.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let event = event(1, 1_000);
        ledger.insert_event(&event).await.unwrap();
        let allocator = allocator(&ledger);

        let (ticket, _) = allocator.reserve_slot(event.id, UserId::new()).await.unwrap();
        assert!(allocator.release_slot(ticket.id, TicketStatus::Expired).await.unwrap());
        assert!(!allocator.release_slot(ticket.id, TicketStatus::Failed).await.unwrap());

        let stored = ledger.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Expired);
        assert_eq!(allocator.remaining_capacity(event.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sold_out_event_refuses() {
        let ledger = InMemoryLedger::new();
        let event = event(1, 1_000);
        ledger.insert_event(&event).await.unwrap();
        let allocator = allocator(&ledger);

        allocator.reserve_slot(event.id, UserId::new()).await.unwrap();
        let err = allocator.reserve_slot(event.id, UserId::new()).await.unwrap_err();
        assert_eq!(err, TicketingError::CapacityExceeded { event_id: event.id });
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_events() {
        let ledger = InMemoryLedger::new();
        let mut inactive = event(5, 1_000);
        inactive.is_active = false;
        ledger.insert_event(&inactive).await.unwrap();
        let allocator = allocator(&ledger);

        let missing = EventId::new();
        assert_eq!(
            allocator.reserve_slot(missing, UserId::new()).await.unwrap_err(),
            TicketingError::EventNotFound(missing)
        );
        assert_eq!(
            allocator.reserve_slot(inactive.id, UserId::new()).await.unwrap_err(),
            TicketingError::EventInactive(inactive.id)
        );
    }

    #[tokio::test]
    async fn test_lock_contention_surfaces_transient() {
        let ledger = InMemoryLedger::new().with_lock_timeout(std::time::Duration::from_millis(5));
        let event = event(5, 1_000);
        ledger.insert_event(&event).await.unwrap();
        let allocator = allocator(&ledger);

        let _held = ledger.begin().await.unwrap();
        let err = allocator.reserve_slot(event.id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, TicketingError::Transient(_)));
    }

    #[tokio::test]
    async fn test_releasing_to_live_status_is_rejected() {
        let ledger = InMemoryLedger::new();
        let event = event(1, 1_000);
        ledger.insert_event(&event).await.unwrap();
        let allocator = allocator(&ledger);
        let (ticket, _) = allocator.reserve_slot(event.id, UserId::new()).await.unwrap();

        let err = allocator.release_slot(ticket.id, TicketStatus::Paid).await.unwrap_err();
        assert!(matches!(err, TicketingError::InvalidStateTransition { .. }));
    }
}
