use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshgen_api::background::status_retention;
use meshgen_api::config::ServerConfig;
use meshgen_api::router::build_app_router;
use meshgen_api::state::AppState;
use meshgen_comfyui::manager::{PipelineClient, PipelineClientConfig};
use meshgen_pipeline::pool::WorkerPool;
use meshgen_pipeline::status_table::StatusTable;
use meshgen_pipeline::worker::GenerationWorker;
use meshgen_pipeline::workflow::WorkflowTemplate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "meshgen_api=debug,meshgen_pipeline=debug,meshgen_comfyui=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    if config.valid_tokens.is_empty() {
        tracing::warn!("VALID_TOKENS is empty; every authenticated request will be rejected");
    }

    // --- Workflow ---
    let workflow = WorkflowTemplate::load(
        &config.workflow_path,
        config.workflow_seed_node.clone(),
        config.workflow_image_node.clone(),
    )
    .with_context(|| format!("Failed to load workflow from {}", config.workflow_path.display()))?;
    tracing::info!(path = %config.workflow_path.display(), "Workflow template loaded");

    // --- Pipeline client ---
    let pipeline = PipelineClient::start(PipelineClientConfig::from_address(
        &config.comfyui_address,
    ));
    tracing::info!(
        address = %config.comfyui_address,
        client_id = pipeline.client_id(),
        "Pipeline client started",
    );

    // --- Status table + worker pool ---
    let status_table = Arc::new(StatusTable::new(config.retention_policy()));
    let worker = Arc::new(GenerationWorker::new(
        pipeline.clone(),
        Arc::clone(&status_table),
        Arc::new(workflow),
        config.worker_settings(),
    ));
    let worker_pool = Arc::new(WorkerPool::start(worker, config.pool_config()));
    tracing::info!(
        max_workers = config.max_workers,
        queue_capacity = config.queue_capacity,
        "Worker pool started",
    );

    // --- Status retention ---
    let retention_cancel = CancellationToken::new();
    let retention_handle = tokio::spawn(status_retention::run(
        Arc::clone(&status_table),
        status_retention::PURGE_INTERVAL,
        retention_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        status_table,
        worker_pool: Arc::clone(&worker_pool),
        backend: pipeline.clone(),
    };

    let app = build_app_router(state, &config)?;

    // --- Start server ---
    let ip = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Workers first: they hold completion waiters on the pipeline client.
    worker_pool.shutdown().await;
    pipeline.shutdown().await;

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Status retention stopped");

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
