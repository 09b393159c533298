#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use meshgen_comfyui::completion::{CompletionOutcome, CompletionRegistry, CompletionWaiter};
use meshgen_comfyui::manager::PipelineClientError;
use meshgen_core::job::{JobState, JobStatus};
use meshgen_pipeline::backend::PipelineBackend;
use meshgen_pipeline::status_table::{RetentionPolicy, StatusTable};
use meshgen_pipeline::worker::{GenerationWorker, WorkerSettings};
use meshgen_pipeline::workflow::WorkflowTemplate;

/// One-pixel PNG, base64 encoded.
pub const PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

/// What the fake backend does when a prompt is queued.
#[derive(Debug, Clone)]
pub enum Script {
    /// Save a model under the workflow's `filename_prefix` and report completion.
    Finish,
    /// Report completion without saving anything.
    FinishWithoutOutput,
    /// Report an execution error with this message.
    Fail(String),
    /// Never report anything.
    Hang,
    /// Refuse the prompt as if the backend were down.
    Reject,
    /// Panic inside `submit`.
    Panic,
}

/// In-process stand-in for the ComfyUI pipeline client.
pub struct FakeBackend {
    registry: Arc<CompletionRegistry>,
    output_dir: PathBuf,
    script: Mutex<Script>,
    connected: AtomicBool,
    pub uploads: Mutex<Vec<PathBuf>>,
    pub workflows: Mutex<Vec<Value>>,
}

impl FakeBackend {
    pub fn new(output_dir: &Path, script: Script) -> Self {
        Self {
            registry: Arc::new(CompletionRegistry::new()),
            output_dir: output_dir.to_path_buf(),
            script: Mutex::new(script),
            connected: AtomicBool::new(true),
            uploads: Mutex::default(),
            workflows: Mutex::default(),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }
}

#[async_trait]
impl PipelineBackend for FakeBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn upload(&self, path: &Path) -> Result<String, PipelineClientError> {
        assert!(path.exists(), "staged input missing at {}", path.display());
        self.uploads.lock().unwrap().push(path.to_path_buf());
        Ok(path.file_name().unwrap().to_string_lossy().into_owned())
    }

    async fn submit(
        &self,
        workflow: &Value,
        prompt_id: &str,
    ) -> Result<CompletionWaiter, PipelineClientError> {
        self.workflows.lock().unwrap().push(workflow.clone());
        let script = self.script.lock().unwrap().clone();

        if let Script::Reject = script {
            return Err(PipelineClientError::ServiceUnavailable(
                "connection refused".into(),
            ));
        }
        let waiter = self.registry.register(prompt_id);
        match script {
            Script::Finish => {
                save_model(&self.output_dir, workflow);
                self.registry.resolve(prompt_id, CompletionOutcome::Finished);
            }
            Script::FinishWithoutOutput => {
                self.registry.resolve(prompt_id, CompletionOutcome::Finished);
            }
            Script::Fail(reason) => {
                self.registry.resolve(prompt_id, CompletionOutcome::Failed(reason));
            }
            Script::Panic => panic!("backend exploded"),
            Script::Hang | Script::Reject => {}
        }
        Ok(waiter)
    }
}

/// Write a model the way SaveGLB names it: `<filename_prefix>_<counter:05>_.glb`.
pub fn save_model(output_dir: &Path, workflow: &Value) -> PathBuf {
    let filename_prefix = workflow["9"]["inputs"]["filename_prefix"].as_str().unwrap();
    let (subfolder, base) = filename_prefix.rsplit_once('/').unwrap_or(("", filename_prefix));
    let dir = output_dir.join(subfolder);
    std::fs::create_dir_all(&dir).unwrap();

    let taken = std::fs::read_dir(&dir)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{base}_"))
        })
        .count();
    let path = dir.join(format!("{base}_{:05}_.glb", taken + 1));
    std::fs::write(&path, b"glTF").unwrap();
    path
}

pub fn workflow() -> Arc<WorkflowTemplate> {
    let document = json!({
        "2": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
        "7": { "class_type": "Hy3DGenerateMesh", "inputs": { "seed": 0 } },
        "9": { "class_type": "SaveGLB", "inputs": { "filename_prefix": "3D/mesh" } }
    });
    Arc::new(WorkflowTemplate::from_value(document, "7", "2").unwrap())
}

/// Worker wired to a fake backend, with its own temp directories.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub table: Arc<StatusTable>,
    pub worker: Arc<GenerationWorker>,
    pub staging: tempfile::TempDir,
    pub output: tempfile::TempDir,
}

impl Harness {
    pub fn new(script: Script, completion_timeout: Duration) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(output.path(), script));
        let table = Arc::new(StatusTable::new(RetentionPolicy::default()));
        let settings = WorkerSettings {
            staging_root: staging.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
            completion_timeout,
            settle_delay: Duration::ZERO,
        };
        let worker = Arc::new(GenerationWorker::new(
            backend.clone(),
            table.clone(),
            workflow(),
            settings,
        ));
        Self {
            backend,
            table,
            worker,
            staging,
            output,
        }
    }
}

/// Poll `table` until the record for `id` satisfies `done`.
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

pub async fn wait_for_terminal(table: &StatusTable, id: &str) -> JobStatus {
    wait_for(table, id, |s| s.state.is_terminal()).await
}

pub async fn wait_for_state(table: &StatusTable, id: &str, state: JobState) -> JobStatus {
    wait_for(table, id, |s| s.state == state).await
}
