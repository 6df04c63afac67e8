//! fleetd - GPU fleet control plane daemon
//!
//! Hosts the cluster state and allocation engine, serves the operator API
//! and runs the lease expiry and lifecycle event loops.

use anyhow::{Context, Result};
use fleet_lib::{Cluster, SimulatedProvisioner, StructuredLogger};
use fleetd::{api, config::ControllerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetd");

    let config = ControllerConfig::load()?;
    info!(
        instance = %config.instance_name,
        api_port = config.api_port,
        lease_ttl_secs = config.lease_ttl_secs,
        "Controller configured"
    );

    let provisioner = Arc::new(SimulatedProvisioner::new(config.provision_delay()));
    let cluster = Cluster::new(config.cluster_config(), provisioner);

    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(CONTROLLER_VERSION);

    let listener = api::bind(config.api_port).await?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let expiry_handle = tokio::spawn(
        cluster
            .allocator()
            .clone()
            .run_expiry_loop(config.sweep_interval(), shutdown_tx.subscribe()),
    );
    let events_handle = tokio::spawn(
        cluster
            .lifecycle()
            .clone()
            .run_event_loop(shutdown_tx.subscribe()),
    );

    let health_handle = tokio::spawn(report_health(
        cluster.clone(),
        logger.clone(),
        config.health_interval(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(cluster));
    let mut api_handle = tokio::spawn(api::serve(listener, app_state.clone()));
    app_state.set_ready(true);

    // Run until a shutdown signal or the API server stops on its own
    let server_failure = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
            None
        }
        result = &mut api_handle => {
            let err = match result {
                Ok(Ok(())) => anyhow::anyhow!("API server exited unexpectedly"),
                Ok(Err(err)) => err,
                Err(join_err) => anyhow::Error::new(join_err).context("API server task failed"),
            };
            error!(error = %err, "API server stopped");
            logger.log_shutdown("API server stopped");
            Some(err)
        }
    };
    app_state.set_ready(false);

    let _ = shutdown_tx.send(());
    for (name, handle) in [
        ("expiry", expiry_handle),
        ("events", events_handle),
        ("health", health_handle),
    ] {
        if let Err(err) = handle.await {
            warn!(task = name, error = %err, "Background task ended abnormally");
        }
    }
    api_handle.abort();

    if let Some(err) = server_failure {
        return Err(err);
    }
    info!("Shutdown complete");
    Ok(())
}

/// Log the cluster health report on a fixed period
async fn report_health(
    cluster: Cluster,
    logger: StructuredLogger,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                logger.log_health(&cluster.health_report());
            }
            _ = shutdown.recv() => {
                info!("Health reporter shutting down");
                break;
            }
        }
    }
}
