//! Workflow document templating.
//!
//! The workflow is a ComfyUI API-format node graph (`{node_id: {class_type,
//! inputs}}`) loaded once at startup. Each job gets its own copy with a
//! fresh seed, the uploaded asset name, and a save prefix tagged with the
//! request id, so one job never picks up another job's output file.

use std::path::{Path, PathBuf};

use serde_json::Value;

/// Node class whose `filename_prefix` determines where the model lands.
const SAVE_NODE_CLASS: &str = "SaveGLB";

/// Prefix ComfyUI uses when a save node does not set one.
const DEFAULT_FILENAME_PREFIX: &str = "ComfyUI";

/// Where the backend writes its output, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    /// Subdirectory under the output directory (empty for the root).
    pub subfolder: String,
    /// File name prefix of the generated artifacts.
    pub prefix: String,
}

impl OutputTarget {
    fn from_filename_prefix(value: &str) -> Self {
        match value.rsplit_once('/') {
            Some((subfolder, base)) => Self {
                subfolder: subfolder.to_string(),
                prefix: base.to_string(),
            },
            None => Self {
                subfolder: String::new(),
                prefix: value.to_string(),
            },
        }
    }

    /// Value for the save node's `filename_prefix` input.
    pub fn filename_prefix(&self) -> String {
        if self.subfolder.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.subfolder, self.prefix)
        }
    }

    /// Leading part of every file the backend saves under this target.
    ///
    /// The backend appends `_<counter>_`, so the trailing underscore keeps
    /// `mesh_r1` from matching `mesh_r10_00001_.glb`.
    pub fn file_prefix(&self) -> String {
        format!("{}_", self.prefix)
    }
}

/// A validated workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    document: Value,
    seed_node: String,
    image_node: String,
    /// Id of the first `SaveGLB` node, if any.
    save_node: Option<String>,
}

impl WorkflowTemplate {
    /// Read and validate a workflow file.
    pub fn load(
        path: &Path,
        seed_node: impl Into<String>,
        image_node: impl Into<String>,
    ) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document = serde_json::from_str(&raw)?;
        Self::from_value(document, seed_node, image_node)
    }

    /// Validate an already-parsed workflow document.
    ///
    /// The image node must exist and declare `inputs.image`; the seed
    /// node is optional.
    pub fn from_value(
        document: Value,
        seed_node: impl Into<String>,
        image_node: impl Into<String>,
    ) -> Result<Self, WorkflowError> {
        let seed_node = seed_node.into();
        let image_node = image_node.into();

        if !document.is_object() {
            return Err(WorkflowError::Invalid(
                "workflow must be a JSON object keyed by node id".into(),
            ));
        }
        if document
            .get(&image_node)
            .and_then(|node| node.get("inputs"))
            .and_then(|inputs| inputs.get("image"))
            .is_none()
        {
            return Err(WorkflowError::Invalid(format!(
                "image input node '{image_node}' not found in workflow"
            )));
        }

        let save_node = document.as_object().and_then(|nodes| {
            nodes
                .iter()
                .find(|(_, node)| {
                    node.get("class_type").and_then(Value::as_str) == Some(SAVE_NODE_CLASS)
                })
                .map(|(id, _)| id.clone())
        });

        Ok(Self {
            document,
            seed_node,
            image_node,
            save_node,
        })
    }

    /// Copy of the workflow with `seed`, `asset_name` and the save prefix
    /// of `target` injected.
    pub fn prepare(&self, seed: u64, asset_name: &str, target: &OutputTarget) -> Value {
        let mut workflow = self.document.clone();

        if let Some(slot) = workflow
            .get_mut(&self.seed_node)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(|inputs| inputs.get_mut("seed"))
        {
            *slot = Value::from(seed);
        }
        if let Some(slot) = workflow
            .get_mut(&self.image_node)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(|inputs| inputs.get_mut("image"))
        {
            *slot = Value::from(asset_name);
        }
        if let Some(inputs) = self
            .save_node
            .as_ref()
            .and_then(|id| workflow.get_mut(id))
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(
                "filename_prefix".to_string(),
                Value::from(target.filename_prefix()),
            );
        }

        workflow
    }

    /// Output location declared by the first `SaveGLB` node.
    pub fn output_target(&self) -> OutputTarget {
        let prefix = self
            .save_node
            .as_ref()
            .and_then(|id| self.document.get(id))
            .and_then(|node| node.get("inputs"))
            .and_then(|inputs| inputs.get("filename_prefix"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FILENAME_PREFIX);
        OutputTarget::from_filename_prefix(prefix)
    }

    /// Output location for one job: the declared prefix tagged with `request_id`.
    ///
    /// Without a save node nothing can be injected and the declared
    /// target is returned as is.
    pub fn output_target_for(&self, request_id: &str) -> OutputTarget {
        let mut target = self.output_target();
        if self.save_node.is_some() {
            target.prefix = format!("{}_{request_id}", target.prefix);
        }
        target
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow configuration is invalid: {0}")]
    Invalid(String),
}
