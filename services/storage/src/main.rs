use anyhow::{Context, Result};
use image_store::api::{start_api_server, AppState};
use image_store::{ChunkedBlobStore, Config, MemoryBlobStore, PgBlobStore, StorageBackend};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.storage.backend,
        retention = ?config.storage.retention,
        "Starting image store"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = open_store(&config).await?;
    let api_state = AppState::new(store, &config.storage, &config.service.name);

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Image store started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down image store");

    api_handle.abort();

    info!("Image store stopped");

    Ok(())
}

/// Build the configured store; returns once it is ready for use
async fn open_store(config: &Config) -> Result<Arc<dyn ChunkedBlobStore>> {
    let storage = &config.storage;

    match storage.backend {
        StorageBackend::Postgres => {
            let store = PgBlobStore::connect(&config.database, &storage.bucket, storage.chunk_size_bytes)
                .await
                .context("Failed to initialize PostgreSQL store")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            info!("Using in-memory store, uploads will not survive a restart");
            Ok(Arc::new(MemoryBlobStore::new(
                storage.bucket.clone(),
                storage.chunk_size_bytes,
            )))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
