//! ComfyUI workflow configuration (`workflows.yaml`).
//!
//! Each workflow carries metadata plus the workflow graph itself, either
//! inline as JSON or referenced by file path. Both shapes are accepted;
//! the loader resolves file paths relative to the config document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{CoreError, ErrorKind};

/// One named ComfyUI workflow with its resolved graph.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// The ComfyUI prompt graph, keyed by node id.
    pub workflow: Value,
    pub default_size: String,
    pub default_steps: u32,
    pub default_cfg: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowsDocument {
    default_workflow: String,
    workflows: BTreeMap<String, WorkflowEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkflowEntry {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: String,
    /// Inline graph; mutually exclusive with `workflow_path`.
    #[serde(default)]
    workflow: Option<Value>,
    /// Graph stored in a separate JSON file, relative to the document.
    #[serde(default)]
    workflow_path: Option<PathBuf>,
    #[serde(default = "default_size")]
    default_size: String,
    #[serde(default = "default_steps")]
    default_steps: u32,
    #[serde(default = "default_cfg")]
    default_cfg: f64,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_size() -> String {
    "512x512".to_string()
}
fn default_steps() -> u32 {
    20
}
fn default_cfg() -> f64 {
    7.0
}

/// Validated workflow catalogue.
#[derive(Debug)]
pub struct WorkflowConfig {
    default_workflow: String,
    workflows: BTreeMap<String, WorkflowSpec>,
}

impl WorkflowConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::new(
                ErrorKind::BadRequest,
                format!("cannot read workflows config {}: {e}", path.display()),
            )
        })?;
        let doc: WorkflowsDocument = serde_yaml::from_str(&raw).map_err(|e| {
            CoreError::new(
                ErrorKind::BadRequest,
                format!("invalid workflows config {}: {e}", path.display()),
            )
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut workflows = BTreeMap::new();

        for (name, entry) in doc.workflows {
            let graph = match (&entry.workflow, &entry.workflow_path) {
                (Some(inline), None) => inline.clone(),
                (None, Some(rel)) => {
                    let file = if rel.is_absolute() {
                        rel.clone()
                    } else {
                        base_dir.join(rel)
                    };
                    let json = std::fs::read_to_string(&file).map_err(|e| {
                        CoreError::new(
                            ErrorKind::BadRequest,
                            format!("workflow '{name}': cannot read {}: {e}", file.display()),
                        )
                    })?;
                    serde_json::from_str(&json).map_err(|e| {
                        CoreError::new(
                            ErrorKind::BadRequest,
                            format!("workflow '{name}': invalid JSON in {}: {e}", file.display()),
                        )
                    })?
                }
                (Some(_), Some(_)) => {
                    return Err(CoreError::new(
                        ErrorKind::BadRequest,
                        format!("workflow '{name}': workflow and workflow_path are mutually exclusive"),
                    ))
                }
                (None, None) => {
                    return Err(CoreError::new(
                        ErrorKind::BadRequest,
                        format!("workflow '{name}': needs workflow (inline) or workflow_path"),
                    ))
                }
            };

            if !graph.is_object() {
                return Err(CoreError::new(
                    ErrorKind::BadRequest,
                    format!("workflow '{name}': graph must be a JSON object"),
                ));
            }

            workflows.insert(
                name.clone(),
                WorkflowSpec {
                    display_name: entry.display_name.unwrap_or_else(|| name.clone()),
                    name,
                    description: entry.description,
                    workflow: graph,
                    default_size: entry.default_size,
                    default_steps: entry.default_steps,
                    default_cfg: entry.default_cfg,
                    tags: entry.tags,
                },
            );
        }

        if !workflows.contains_key(&doc.default_workflow) {
            return Err(CoreError::new(
                ErrorKind::BadRequest,
                format!(
                    "default_workflow '{}' not found. Available workflows: {:?}",
                    doc.default_workflow,
                    workflows.keys().collect::<Vec<_>>()
                ),
            ));
        }

        Ok(Self {
            default_workflow: doc.default_workflow,
            workflows,
        })
    }

    pub fn get(&self, name: &str) -> Result<&WorkflowSpec, CoreError> {
        self.workflows.get(name).ok_or_else(|| {
            CoreError::bad_request(format!(
                "Workflow '{name}' not found. Available: {:?}",
                self.list()
            ))
        })
    }

    pub fn default_workflow(&self) -> &str {
        &self.default_workflow
    }

    pub fn list(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }
}
