//! # Lnticket Testing
//!
//! Testing utilities for the ticketing engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`MockClock`])
//! - [`InMemoryLedger`], a ledger with serialized transactions
//! - [`MockPaymentProvider`], a scriptable payment provider
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - proptest strategies for statuses and observation sequences
//!
//! ## Example
//!
//! ```ignore
//! use lnticket_testing::{InMemoryLedger, MockPaymentProvider, test_clock};
//!
//! #[tokio::test]
//! async fn test_purchase() {
//!     let ledger = Arc::new(InMemoryLedger::new());
//!     let provider = Arc::new(MockPaymentProvider::new());
//!     let engine = TicketingEngine::new(ledger, provider, Arc::new(test_clock()), config);
//!
//!     let (ticket, _invoice) = engine.purchase_ticket(event_id, user_id).await?;
//!     assert_eq!(ticket.status, TicketStatus::Pending);
//! }
//! ```

use chrono::{DateTime, Utc};
use lnticket_core::environment::Clock;

pub mod ledger;
pub mod provider;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use lnticket_testing::mocks::FixedClock;
    /// use lnticket_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that tests move forward by hand.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the engine.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a mock clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[allow(clippy::unwrap_used)] // Test utility
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[allow(clippy::unwrap_used)] // Test utility
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    impl Clock for MockClock {
        #[allow(clippy::unwrap_used)] // Test utility
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }

    /// The time [`test_clock`] returns
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and utilities
pub mod helpers {
    use lnticket_core::types::{Event, Sats};

    use crate::mocks::test_time;

    /// Install a tracing subscriber that writes through the test harness.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// An active event created at the test epoch
    #[must_use]
    pub fn event(capacity: u32, price: u64) -> Event {
        Event::new("Test Event", capacity, Sats::new(price), test_time())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use lnticket_core::types::{InvoiceStatus, ObservationSource};
    use proptest::prelude::*;

    /// Any invoice status
    pub fn invoice_status() -> impl Strategy<Value = InvoiceStatus> {
        prop_oneof![
            Just(InvoiceStatus::Pending),
            Just(InvoiceStatus::Paid),
            Just(InvoiceStatus::Expired),
            Just(InvoiceStatus::Failed),
        ]
    }

    /// Any observation source
    pub fn observation_source() -> impl Strategy<Value = ObservationSource> {
        prop_oneof![
            Just(ObservationSource::Push),
            Just(ObservationSource::Poll),
            Just(ObservationSource::Sweeper),
            Just(ObservationSource::Admin),
        ]
    }

    /// Sequences of reported statuses with their sources, 1..=`max_len` long
    pub fn observation_sequence(
        max_len: usize,
    ) -> impl Strategy<Value = Vec<(InvoiceStatus, ObservationSource)>> {
        prop::collection::vec((invoice_status(), observation_source()), 1..=max_len)
    }
}

// Re-export commonly used items
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, MockClock, test_clock, test_time};
pub use provider::MockPaymentProvider;
pub use reducer_test::ReducerTest;
