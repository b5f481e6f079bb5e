use anyhow::{Context, Result};
use jwt_refresher::api::{create_router, ApiState};
use jwt_refresher::config::{relocate_legacy_database, RefresherConfig, DB_FILE_NAME};
use jwt_refresher::credentials::CredentialStore;
use jwt_refresher::logging::init_logging;
use jwt_refresher::refresher::RefreshEngine;
use jwt_refresher::scheduler::Scheduler;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RefresherConfig::load().context("Failed to load configuration")?;

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.data_dir.display()
        )
    })?;

    let _log_guard = init_logging(&config.data_dir, &config.log_file)?;

    info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        tick_interval_secs = config.tick_interval_secs,
        "JWT refresher starting"
    );

    // Databases from older layouts lived in the working directory
    relocate_legacy_database(Path::new(DB_FILE_NAME), &config.data_dir)
        .context("Failed to relocate legacy database")?;

    let db_path = config.db_path();
    let store = Arc::new(
        CredentialStore::new(&db_path, &config.encryption_key)
            .context("Failed to initialize credential store")?,
    );
    info!(db_path = %db_path.display(), "Credential store initialized");

    let engine = Arc::new(RefreshEngine::new(Arc::clone(&store)));

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        config.tick_interval(),
    );
    scheduler.start();

    // Start HTTP API server
    let api_state = ApiState {
        store: Arc::clone(&store),
        engine: Arc::clone(&engine),
        username: config.username.clone(),
        password: config.password.clone(),
    };
    let router = create_router(api_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .context("Failed to bind admin API port")?;
    info!(port = config.port, username = %config.username, "Admin API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Admin API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    scheduler.stop().await;
    server_handle.abort();
    info!("JWT refresher stopped");

    Ok(())
}
