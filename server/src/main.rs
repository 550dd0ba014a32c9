//! Ticket settlement service.
//!
//! Connects to PostgreSQL, applies migrations, wires the LNbits adapter
//! behind its timeout and circuit breaker, and runs the expiry sweeper,
//! settlement poller and reconciler mailboxes until Ctrl+C or SIGTERM.
//!
//! Run with: `cargo run --bin lnticket-server`
//! Metrics: <http://localhost:9090/metrics>

use lnticket_core::environment::SystemClock;
use lnticket_postgres::PostgresLedger;
use lnticket_runtime::metrics::MetricsServer;
use lnticket_runtime::{EngineConfig, TicketingEngine, build_provider};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = EngineConfig::from_env()?;
    info!(
        invoice_ttl_secs = config.invoice.ttl_secs,
        shards = config.reconciler.shards,
        "Starting ticket settlement service"
    );

    MetricsServer::new(config.server.metrics_addr).start()?;

    info!(
        host = config.database.url.split('@').next_back().unwrap_or("unknown"),
        "Connecting to PostgreSQL"
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database.url)
        .await?;

    let ledger = PostgresLedger::new(pool, config.allocator.lock_timeout());
    ledger.migrate().await?;
    info!("Migrations complete");

    let provider = build_provider(&config.provider, &config.provider_guard)?;

    let engine = TicketingEngine::new(
        Arc::new(ledger),
        provider,
        Arc::new(SystemClock),
        config,
    );
    let running = engine.start();
    info!("Ticket settlement service ready");

    wait_for_shutdown_signal().await;
    running.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lnticket=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
