// Main entry point for the cave server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cave_server::{build_app, load_cave, CaveFile, ServerConfig};
use tome::{InMemoryViewStore, TomeManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cave_server=debug,tome=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting cave server");

    // Load configuration
    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    let manager = TomeManager::new().with_store("memory", Arc::new(InMemoryViewStore::new()));

    let cave = match &config.cave_config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading cave config");
            load_cave(&manager, CaveFile::load(path)?)?
        }
        None => {
            tracing::warn!("CAVE_CONFIG not set, serving without tomes");
            None
        }
    };
    tracing::info!(tomes = ?manager.list_tomes(), "Tomes registered");

    // Build application
    let app = build_app(manager, cave, config.registry_enabled);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    // Peer address backs the rate limiter when no forwarding header is present
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Server error")?;

    Ok(())
}
