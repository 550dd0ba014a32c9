//! Shared engine fixture for the runtime integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Utc};
use lnticket_core::environment::Clock;
use lnticket_core::ledger::Ledger;
use lnticket_core::types::{Event, Invoice, Ticket, UserId};
use lnticket_runtime::{EngineConfig, TicketingEngine};
use lnticket_testing::helpers::{event, init_test_tracing};
use lnticket_testing::{InMemoryLedger, MockClock, MockPaymentProvider, test_time};
use std::sync::Arc;

pub const PRICE: u64 = 2_100;

pub struct Harness {
    pub engine: Arc<TicketingEngine>,
    pub ledger: InMemoryLedger,
    pub provider: MockPaymentProvider,
    pub clock: MockClock,
    pub event: Event,
}

/// Engine config with short retry budgets so failure paths stay fast.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poller.max_retries = 1;
    config.sweeper.final_check_timeout_ms = 500;
    config.reconciler.shards = 4;
    config.server.shutdown_timeout_secs = 5;
    config
}

pub async fn harness(capacity: u32) -> Harness {
    harness_with(capacity, test_config()).await
}

pub async fn harness_with(capacity: u32, config: EngineConfig) -> Harness {
    init_test_tracing();
    let ledger = InMemoryLedger::new();
    let provider = MockPaymentProvider::new();
    let clock = MockClock::new(test_time());
    let event = event(capacity, PRICE);
    ledger.insert_event(&event).await.unwrap();

    let engine = Arc::new(TicketingEngine::new(
        Arc::new(ledger.clone()),
        Arc::new(provider.clone()),
        Arc::new(clock.clone()),
        config,
    ));

    Harness {
        engine,
        ledger,
        provider,
        clock,
        event,
    }
}

impl Harness {
    pub async fn purchase(&self) -> (Ticket, Invoice) {
        self.engine
            .purchase_ticket(self.event.id, UserId::new())
            .await
            .unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }

    pub async fn ticket(&self, ticket: &Ticket) -> Ticket {
        self.ledger.get_ticket(ticket.id).await.unwrap().unwrap()
    }

    pub async fn invoice(&self, invoice: &Invoice) -> Invoice {
        self.ledger.get_invoice(invoice.id).await.unwrap().unwrap()
    }
}
