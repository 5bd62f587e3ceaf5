//! Kube Recorder - Kubernetes state and performance history recorder
//!
//! Records a cluster snapshot into the relational store on every tick and
//! serves health and Prometheus endpoints alongside.

use anyhow::{Context, Result};
use kube_recorder::{api, config::RecorderConfig};
use recorder_lib::{
    CycleEngine, FileSnapshotSource, HealthRegistry, RecorderLoopBuilder, RecorderMetrics,
    SchemaCatalog, Store, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const RECORDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting kube-recorder");

    let config = RecorderConfig::load()?;
    info!(
        database = %config.database_path.display(),
        snapshot = %config.snapshot_path.display(),
        "Recorder configured"
    );

    let catalog = match &config.schema_path {
        Some(path) => SchemaCatalog::load(path).await?,
        None => SchemaCatalog::builtin().context("Built-in schema is invalid")?,
    };
    let tables = catalog.reference_tables().count() + 2 * catalog.metric_bases().count();

    let store = Store::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = RecorderMetrics::new();

    let logger = StructuredLogger::new(config.cluster_name.clone());
    logger.log_startup(
        RECORDER_VERSION,
        &config.database_path.display().to_string(),
        tables,
    );

    let engine = CycleEngine::new(store, catalog, config.engine_config());
    let recorder = RecorderLoopBuilder::new()
        .engine(engine)
        .source(Arc::new(FileSnapshotSource::new(config.snapshot_path.clone())))
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(health_registry, metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let loop_handle = tokio::spawn(recorder.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    let _ = shutdown_tx.send(());

    for (name, handle) in [("recorder loop", loop_handle), ("api server", api_handle)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task failed"),
            Err(e) => error!(task = name, error = %e, "Task panicked"),
        }
    }

    Ok(())
}
