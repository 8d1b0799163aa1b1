use std::sync::Arc;

use anyhow::{Context, Result};
use sagaflow_durable::{
    CheckpointStorage, PostgresCheckpointStorage, Services, WorkflowOrchestrator,
    WorkflowRegistry,
};
use sagaflow_worker::{init_telemetry, register_workflows, Ledger, TelemetryConfig, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Variables in .env apply unless already set in the environment
    let dotenv = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info,sagaflow_worker=debug")
    // - LOG_FORMAT: "json" for structured logs
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config);

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }
    tracing::info!(service = %telemetry_config.service_name, "sagaflow-worker starting...");

    let config = WorkerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let storage = PostgresCheckpointStorage::with_config(pool, config.storage.clone());
    storage
        .migrate()
        .await
        .context("Failed to apply saga migrations")?;
    let storage: Arc<dyn CheckpointStorage> = Arc::new(storage);

    let mut registry = WorkflowRegistry::new();
    register_workflows(&mut registry)?;

    let orchestrator = Arc::new(
        WorkflowOrchestrator::with_config(registry, Arc::clone(&storage), config.orchestrator.clone())
            .with_services(Services::new().with(Ledger::new())),
    );
    orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;

    tracing::info!(
        max_connections = config.max_connections,
        max_concurrent_handlers = config.orchestrator.max_concurrent_handlers,
        reaper_interval_secs = config.reaper_interval.as_secs(),
        "Worker ready"
    );

    // Purge expired checkpoints and execution records
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let reaper_storage = Arc::clone(&storage);
    let reaper_interval = config.reaper_interval;
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => match reaper_storage.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Purged expired transactions"),
                    Err(e) => tracing::warn!(error = %e, "Failed to purge expired transactions"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    shutdown_tx.send_replace(true);
    orchestrator.shutdown().await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Reaper task ended abnormally");
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
