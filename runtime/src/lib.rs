//! # Lnticket Runtime
//!
//! Executes the ticketing engine on top of the traits in `lnticket-core`.
//!
//! ## Core Components
//!
//! - **Inventory Allocator**: reserves and releases capacity slots under the event lock
//! - **Invoice Lifecycle Manager**: issues and retries invoices through the payment provider
//! - **Reconciler**: applies settlement observations through per-invoice mailboxes
//! - **Expiry Sweeper**: closes overdue invoices and reclaims orphaned reservations
//! - **Settlement Poller**: asks the provider about pending invoices
//! - **Ticketing Engine**: wires everything from one [`EngineConfig`]
//!
//! ## Example
//!
//! ```ignore
//! use lnticket_runtime::{EngineConfig, TicketingEngine, build_provider};
//!
//! let config = EngineConfig::from_env()?;
//! let provider = build_provider(&config.provider, &config.provider_guard)?;
//! let engine = TicketingEngine::new(ledger, provider, Arc::new(SystemClock), config);
//! let running = engine.start();
//!
//! let (ticket, invoice) = engine.purchase_ticket(event_id, user_id).await?;
//!
//! running.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Slot reservation and release
pub mod allocator;

/// Circuit breaker around provider calls
pub mod circuit_breaker;

/// Engine configuration loaded from the environment
pub mod config;

/// Caller-facing facade and background task lifecycle
pub mod engine;

/// Invoice issuance and administrative retry
pub mod invoices;

/// Prometheus metrics
pub mod metrics;

/// Periodic settlement polling
pub mod poller;

/// Payment provider adapters
pub mod providers;

/// Settlement reconciliation and its mailboxes
pub mod reconciler;

/// Retry logic with exponential backoff
pub mod retry;

/// Expiry sweeping and orphan reclaim
pub mod sweeper;

pub use allocator::InventoryAllocator;
pub use config::{ConfigError, EngineConfig};
pub use engine::{RunningEngine, TicketingEngine};
pub use invoices::InvoiceLifecycleManager;
pub use poller::{PollReport, SettlementPoller};
pub use providers::{ProviderConfig, build_provider};
pub use reconciler::{Reconciler, ReconcilerHandle};
pub use sweeper::{ExpirySweeper, SweepReport};
