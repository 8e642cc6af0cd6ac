mod api;
mod capture;
mod config;
mod error;
mod ingest;
mod probe;
mod scheduler;
mod seed;
mod store;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::ingest::Ingestor;
use crate::store::HistoryDb;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("traceroute_historyd=info"))
        )
        .init();

    tracing::info!("Starting traceroute-historyd {}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/traceroute-history/historyd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = HistoryDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let seeded = seed::seed_destinations(&db, &config.destinations)?;
    if seeded > 0 {
        tracing::info!("Registered {} destinations from config", seeded);
    }

    let ingestor = Arc::new(Ingestor::new(Arc::new(db)));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn probe scheduler
    let scheduler_handle = if config.probe.enabled {
        let sched_ingestor = ingestor.clone();
        let sched_config = config.probe.clone();
        let sched_cancel = cancel.clone();
        tracing::info!(
            "Probing with {} every {}s",
            config.probe.command,
            config.probe.interval_secs
        );
        Some(tokio::spawn(async move {
            if let Err(e) = scheduler::run(sched_ingestor, sched_config, sched_cancel).await {
                tracing::error!("Scheduler error: {}", e);
            }
        }))
    } else {
        tracing::info!("Probing disabled, accepting captures over the API only");
        None
    };

    // Build API router
    let app_state = api::routes::AppState::new(ingestor.clone(), config.api.max_page_size);
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    let _ = server_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
