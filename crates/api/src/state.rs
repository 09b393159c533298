use std::sync::Arc;

use meshgen_pipeline::backend::PipelineBackend;
use meshgen_pipeline::pool::WorkerPool;
use meshgen_pipeline::status_table::StatusTable;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (bearer tokens, output directory).
    pub config: Arc<ServerConfig>,
    /// Status records of every accepted request.
    pub status_table: Arc<StatusTable>,
    /// Runs generation jobs off the request path.
    pub worker_pool: Arc<WorkerPool>,
    /// Pipeline backend, consulted by the health check.
    pub backend: Arc<dyn PipelineBackend>,
}
