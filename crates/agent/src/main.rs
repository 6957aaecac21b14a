//! Telemetry Agent - per-node container log and metrics shipper
//!
//! This binary runs on each cluster node, follows the logs and stats of
//! every running container and publishes them to the message bus.

use agent_lib::{
    bus::{BusConnectOptions, HttpBus},
    collector::{CheckpointStore, PollLoopBuilder},
    engine::DockerEngine,
    health::Liveness,
    observability::{AgentMetrics, StructuredLogger},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting telemetry-agent");

    // Load configuration
    let config = config::AgentConfig::load().context("Failed to load configuration")?;
    info!(node_id = %config.node_id, engine_url = %config.engine_url, "Agent configured");

    let logger = StructuredLogger::new(&config.node_id);
    let metrics = AgentMetrics::new();
    let collection = config.collection_config();

    CheckpointStore::new(
        collection.checkpoint_dir.clone(),
        collection.checkpoint_period,
        metrics,
    )
    .ensure_dir()
    .await
    .with_context(|| {
        format!(
            "Failed to create checkpoint directory {}",
            collection.checkpoint_dir.display()
        )
    })?;

    let engine = DockerEngine::new(&config.engine_url).context("Invalid engine endpoint")?;
    let bus = HttpBus::connect(BusConnectOptions {
        url: config.bus_url.clone(),
        cluster_id: config.bus_cluster_id.clone(),
        client_id: config.bus_client_id(),
        timeout: config.bus_timeout(),
    })
    .await
    .context("Failed to connect to message bus")?;

    let liveness = Liveness::new();
    let poll_loop = PollLoopBuilder::new()
        .engine(Arc::new(engine))
        .bus(Arc::new(bus))
        .liveness(liveness.clone())
        .config(collection)
        .build()?;
    let collector = poll_loop.collector();

    logger.log_startup(AGENT_VERSION);

    // Start liveness and metrics server
    let app_state = Arc::new(api::AppState::new(liveness));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(poll_loop.run(shutdown_rx));

    let reason = tokio::select! {
        reason = shutdown_signal() => reason,
        result = api_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            "API server stopped"
        }
    };
    logger.log_shutdown(reason);

    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Poll loop task failed");
    }
    collector.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
