//! simplefs-cache: disk-backed HTTP cache storage server.
//!
//! Stores compressed cache entries as files in one directory, with
//! per-entry TTLs, an entry-count limit, a directory byte quota and
//! multi-level (Vary) variant mapping. Exposes the store over HTTP.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use simplefs_cache::config::{Cli, Config};
use simplefs_cache::server::api::{build_router, AppState};
use simplefs_cache::{SimpleFs, Storer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "simplefs_cache=debug,tower_http=debug"
    } else {
        "simplefs_cache=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("simplefs-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    let config = Arc::new(config);

    info!(
        listen = %config.server.listen,
        size = config.storage.size,
        directory_size = %config.storage.directory_size,
        compression = %config.storage.compression,
        "Configuration loaded"
    );

    // Provision and initialize the store.
    let store = Arc::new(SimpleFs::provision(&config.storage)?);
    let init = store.clone();
    tokio::task::spawn_blocking(move || init.init()).await??;

    info!(
        uuid = %store.uuid(),
        entries = store.entry_count(),
        bytes_on_disk = store.disk_usage(),
        "Storage ready"
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.stop_sweeper();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
