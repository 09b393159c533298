#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use meshgen_api::config::ServerConfig;
use meshgen_api::router::build_app_router;
use meshgen_api::state::AppState;
use meshgen_comfyui::completion::{CompletionOutcome, CompletionRegistry, CompletionWaiter};
use meshgen_comfyui::manager::PipelineClientError;
use meshgen_core::job::{JobState, JobStatus};
use meshgen_pipeline::backend::PipelineBackend;
use meshgen_pipeline::pool::{PoolConfig, WorkerPool};
use meshgen_pipeline::status_table::{RetentionPolicy, StatusTable};
use meshgen_pipeline::worker::{GenerationWorker, WorkerSettings};
use meshgen_pipeline::workflow::WorkflowTemplate;

pub const TOKEN: &str = "test-token";

/// One-pixel PNG, base64 encoded.
pub const PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

/// Pipeline stand-in: either finishes immediately with a GLB saved under
/// the workflow's `filename_prefix`, or never reports back.
pub struct FakeBackend {
    registry: Arc<CompletionRegistry>,
    output_dir: PathBuf,
    hang: AtomicBool,
    connected: AtomicBool,
}

impl FakeBackend {
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

#[async_trait]
impl PipelineBackend for FakeBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn upload(&self, path: &Path) -> Result<String, PipelineClientError> {
        Ok(path.file_name().unwrap().to_string_lossy().into_owned())
    }

    async fn submit(
        &self,
        workflow: &Value,
        prompt_id: &str,
    ) -> Result<CompletionWaiter, PipelineClientError> {
        let waiter = self.registry.register(prompt_id);
        if !self.hang.load(Ordering::Relaxed) {
            let filename_prefix = workflow["9"]["inputs"]["filename_prefix"].as_str().unwrap();
            let path = self.output_dir.join(format!("{filename_prefix}_00001_.glb"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"glTF").unwrap();
            self.registry.resolve(prompt_id, CompletionOutcome::Finished);
        }
        Ok(waiter)
    }
}

/// Build a test `ServerConfig` with safe defaults and a single valid token.
pub fn test_config(output_dir: &Path, staging_dir: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        max_body_bytes: 32 * 1024 * 1024,
        shutdown_timeout_secs: 1,
        output_dir: output_dir.to_path_buf(),
        staging_dir: staging_dir.to_path_buf(),
        comfyui_address: "127.0.0.1:8188".to_string(),
        workflow_path: PathBuf::from("workflow.json"),
        workflow_seed_node: "7".to_string(),
        workflow_image_node: "2".to_string(),
        max_workers: 2,
        queue_capacity: 8,
        valid_tokens: [TOKEN.to_string()].into_iter().collect(),
        completion_timeout_secs: 30,
        settle_delay_ms: 0,
        status_ttl_secs: 3600,
        status_capacity: 100,
    }
}

pub fn workflow() -> Arc<WorkflowTemplate> {
    let document = json!({
        "2": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
        "7": { "class_type": "Hy3DGenerateMesh", "inputs": { "seed": 0 } },
        "9": { "class_type": "SaveGLB", "inputs": { "filename_prefix": "3D/mesh" } }
    });
    Arc::new(WorkflowTemplate::from_value(document, "7", "2").unwrap())
}

/// The full application wired to a fake pipeline backend.
pub struct TestApp {
    pub router: Router,
    pub table: Arc<StatusTable>,
    pub pool: Arc<WorkerPool>,
    pub backend: Arc<FakeBackend>,
    pub output: tempfile::TempDir,
    pub staging: tempfile::TempDir,
}

/// Build the application exactly as `main.rs` does, with `configure`
/// applied to the test configuration first.
pub fn build_test_app_with(configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let output = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let mut config = test_config(output.path(), staging.path());
    configure(&mut config);

    let backend = Arc::new(FakeBackend {
        registry: Arc::new(CompletionRegistry::new()),
        output_dir: output.path().to_path_buf(),
        hang: AtomicBool::new(false),
        connected: AtomicBool::new(true),
    });
    let table = Arc::new(StatusTable::new(RetentionPolicy {
        ttl: Duration::from_secs(config.status_ttl_secs),
        capacity: config.status_capacity,
    }));
    let worker = Arc::new(GenerationWorker::new(
        backend.clone(),
        table.clone(),
        workflow(),
        WorkerSettings {
            staging_root: config.staging_dir.clone(),
            output_dir: config.output_dir.clone(),
            completion_timeout: Duration::from_secs(config.completion_timeout_secs),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        },
    ));
    let pool = Arc::new(WorkerPool::start(
        worker,
        PoolConfig {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
            shutdown_grace: Duration::from_secs(config.shutdown_timeout_secs),
        },
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        status_table: table.clone(),
        worker_pool: pool.clone(),
        backend: backend.clone(),
    };
    let router = build_app_router(state, &config).unwrap();

    TestApp {
        router,
        table,
        pool,
        backend,
        output,
        staging,
    }
}

pub fn build_test_app() -> TestApp {
    build_test_app_with(|_| {})
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str, token: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

pub async fn post_raw(app: &Router, uri: &str, token: Option<&str>, body: &str) -> Response<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    send(app, builder.body(Body::from(body.to_string())).unwrap()).await
}

pub async fn post_json(app: &Router, uri: &str, token: Option<&str>, body: Value) -> Response<Body> {
    post_raw(app, uri, token, &body.to_string()).await
}

/// Submit a valid generation request for `id` with the test token.
pub async fn submit(app: &Router, id: &str) -> Response<Body> {
    post_json(
        app,
        "/generate",
        Some(TOKEN),
        json!({ "id": id, "image": PNG_BASE64 }),
    )
    .await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Poll the status table until the record for `id` satisfies `done`.
pub async fn wait_for(
    table: &StatusTable,
    id: &str,
    done: impl Fn(&JobStatus) -> bool,
) -> JobStatus {
    for _ in 0..300 {
        if let Some(status) = table.get(id).await {
            if done(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {id} never reached the expected state");
}

pub async fn wait_for_state(table: &StatusTable, id: &str, state: JobState) -> JobStatus {
    wait_for(table, id, |s| s.state == state).await
}
