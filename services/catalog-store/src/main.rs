use anyhow::{Context, Result};
use catalog_store::{Config, DynamoStoreClient, VideoCatalog};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        table = %config.dynamodb.table_name,
        "Starting catalog store check"
    );

    let store = DynamoStoreClient::new(&config.dynamodb)
        .await
        .context("Failed to initialize DynamoDB client")?;

    if config.dynamodb.create_table {
        store
            .ensure_table(config.table_ready_timeout())
            .await
            .context("Failed to create table")?;
    }

    let description = store.describe().await.context("Failed to describe table")?;
    info!(
        table = %description.name,
        status = ?description.status,
        item_count = ?description.item_count,
        "Table available"
    );

    // Cancel backoff waits on shutdown
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let catalog = VideoCatalog::with_config(Arc::new(store), &config.writer, &config.scan, cancel);

    catalog
        .verify_connection()
        .await
        .context("DynamoDB connection test failed")?;

    let untranscribed = catalog
        .untranscribed_videos()
        .await
        .context("Failed to get untranscribed videos")?;
    let transcribed = catalog
        .transcribed_videos()
        .await
        .context("Failed to get transcribed videos")?;

    info!(
        untranscribed = untranscribed.len(),
        transcribed = transcribed.len(),
        "Catalog store check passed"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

    token.cancel();
}
