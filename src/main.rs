//! Lockbridge Coordinator - cross-ledger atomic swap coordination
//!
//! The coordinator watches escrow events across configured ledgers, runs
//! Dutch auctions to select resolvers for each fill opportunity, builds
//! mirrored hashlocked escrow pairs, propagates revealed secrets, and
//! refunds whatever expires unclaimed.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod auction;
mod config;
mod coordinator;
mod error;
mod escrow;
mod fill;
mod ledger;
mod metrics;
mod state;

use config::Settings;
use coordinator::SwapCoordinator;
use ledger::LedgerManager;
use metrics::MetricsServer;
use state::{PgStateManager, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!(
        "Starting Lockbridge Coordinator v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} ledgers",
        settings.enabled_ledgers().len()
    );

    // Initialize database connection
    let pg = Arc::new(PgStateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    pg.run_migrations().await?;
    info!("Database migrations complete");
    let store: Arc<dyn Store> = pg;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize ledger clients. Concrete RPC adapters register here;
    // a ledger configured without one cannot move funds.
    let ledgers = Arc::new(LedgerManager::new());
    for (name, _config) in settings.enabled_ledgers() {
        warn!(
            "Ledger {} is enabled but no adapter is registered for it",
            name
        );
    }

    // Initialize the coordination engine and reload open orders
    let coordinator = Arc::new(SwapCoordinator::new(
        &settings,
        ledgers.clone(),
        store.clone(),
    ));
    coordinator.restore(chrono::Utc::now()).await?;
    info!("Swap coordinator initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let settings = settings.clone();
        let coordinator = coordinator.clone();
        let store = store.clone();
        let ledgers = ledgers.clone();
        async move {
            if let Err(e) = api::run_server(settings.api, coordinator, store, ledgers).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start the per-ledger event pumps
    ledgers.start_pumps(store.clone()).await?;

    // Start the coordination engine
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator.run().await;
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let ledgers = ledgers.clone();
        let store = store.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut ok = true;
                for (ledger_id, healthy) in ledgers.health_check().await {
                    if !healthy {
                        warn!("Ledger {} health check failed", ledger_id);
                        ok = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    ok = false;
                }

                if ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Lockbridge Coordinator is running");
    info!(
        "API server: http://{}:{}",
        settings.api.host, settings.api.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    coordinator.stop().await;

    // Abort background tasks
    api_handle.abort();
    coordinator_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Lockbridge Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,lockbridge_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
