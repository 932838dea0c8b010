//! tiered-cache: multi-layer cache service.
//!
//! Serves a hot → warm → cold cache of JSON values over HTTP:
//!   hot (in-process) → warm (in-process) → cold (external backend)

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tiered_cache::config::{Cli, Config};
use tiered_cache::server::{build_router, AppState};
use tiered_cache::CacheManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tiered_cache=debug,tower_http=debug"
    } else {
        "tiered_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tiered-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);

    info!(
        hot_entries = config.layers.hot.max_entries,
        hot_bytes = config.layers.hot.max_memory_bytes,
        warm_entries = config.layers.warm.max_entries,
        warm_bytes = config.layers.warm.max_memory_bytes,
        cold = config.layers.cold.enabled,
        policy = %config.eviction_policy,
        "Layer capacities"
    );

    let cache = CacheManager::new(config.clone())?;
    let state = Arc::new(AppState::new(cache));

    // Build the HTTP router.
    let app = build_router(state.clone());

    // Start the server.
    let listen_addr = cli.listen;
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.cache.stop().await;
    Ok(())
}

/// Resolves on Ctrl-C after stopping the cache, which also ends open event streams.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    state.cache.stop().await;
}
