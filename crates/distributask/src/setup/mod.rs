//! Application setup and lifecycle

pub mod database;
pub mod services;
pub mod shutdown;

use anyhow::{Context, Result};
use distributask_core::Config;
use tokio_util::sync::CancellationToken;

use services::Services;

/// Validate config, start telemetry and build every component.
pub async fn initialize_app(config: &Config) -> Result<Services> {
    // Fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    distributask_infra::init_telemetry(config.log_format, &config.environment)?;
    tracing::info!(
        environment = %config.environment,
        backend = %config.queue.backend,
        concurrency = config.worker.concurrency,
        "Configuration loaded and validated successfully"
    );

    services::initialize_services(config).await
}

/// Start the worker pool and reconciler, then stop both on a shutdown signal.
pub async fn run_until_shutdown(services: Services) -> Result<()> {
    let pool = services.processor.clone().start();

    let reconcile_shutdown = CancellationToken::new();
    let reconciler = services
        .reconciler
        .clone()
        .map(|reconciler| reconciler.spawn(reconcile_shutdown.clone()));

    tracing::info!("Distributask ready and processing tasks");
    shutdown::shutdown_signal().await;

    reconcile_shutdown.cancel();
    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Reconciler terminated abnormally");
        }
    }
    pool.shutdown().await;

    tracing::info!("Distributask stopped");
    Ok(())
}
