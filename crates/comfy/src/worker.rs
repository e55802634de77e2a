//! [`ComfyWorker`]: the engine `Worker` implementation backed by a
//! ComfyUI server, and the default [`WorkerFactory`] that builds it.
//!
//! The worker runs on the pool's dedicated OS thread; its `run` drives
//! the async protocol clients through a captured runtime handle. One job
//! maps to one workflow submission: connect, (optionally) upload the
//! init image, submit the rendered graph, pump progress messages until
//! completion, then fetch the output bytes from history.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use darkroom_core::job::{Job, JobPayload};
use darkroom_core::mode::ModeSpec;
use darkroom_core::workflow::WorkflowConfig;
use darkroom_engine::worker::{
    ProgressFn, ProgressUpdate, RunOutput, Worker, WorkerError, WorkerFactory,
};

use crate::api::ComfyApi;
use crate::backoff::{connect_with_backoff, BackoffConfig};
use crate::client::ComfyClient;
use crate::messages::{parse_message, ComfyMessage};
use crate::template::{render, Vars};

/// Workflow name used for standalone super-resolution jobs.
const SR_WORKFLOW: &str = "superres";

/// Addresses of the backing ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyEndpoints {
    pub ws_url: String,
    pub api_url: String,
}

/// The default worker factory: inspects the mode's model files and
/// builds a [`ComfyWorker`] for backends ComfyUI can serve.
pub struct ComfyWorkerFactory {
    endpoints: ComfyEndpoints,
    workflows: Arc<WorkflowConfig>,
    rt: tokio::runtime::Handle,
}

impl ComfyWorkerFactory {
    /// Capture the current runtime handle; the built workers use it to
    /// drive async IO from the pool's blocking thread.
    pub fn new(endpoints: ComfyEndpoints, workflows: Arc<WorkflowConfig>) -> Self {
        Self {
            endpoints,
            workflows,
            rt: tokio::runtime::Handle::current(),
        }
    }
}

impl WorkerFactory for ComfyWorkerFactory {
    fn build(&self, worker_id: u32, spec: &ModeSpec) -> Result<Box<dyn Worker>, WorkerError> {
        if !backend_supported(&spec.model_path) {
            return Err(WorkerError::LoadFailed(format!(
                "no backend for model file {}",
                spec.model_path.display()
            )));
        }
        tracing::info!(worker_id, mode = %spec.name, model = %spec.model, "Building ComfyUI worker");
        Ok(Box::new(ComfyWorker {
            spec: spec.clone(),
            endpoints: self.endpoints.clone(),
            workflows: Arc::clone(&self.workflows),
            rt: self.rt.clone(),
        }))
    }
}

/// A checkpoint file or a diffusers pipeline root. Anything else has no
/// backend dispatch.
fn backend_supported(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(ext, "safetensors" | "ckpt"),
        // Extensionless paths are diffusers pipeline roots.
        None => true,
    }
}

/// What one job renders down to before submission.
struct RenderPlan {
    workflow: Value,
    vars: Vars,
    seed: Option<u64>,
    did_superres: bool,
}

pub struct ComfyWorker {
    spec: ModeSpec,
    endpoints: ComfyEndpoints,
    workflows: Arc<WorkflowConfig>,
    rt: tokio::runtime::Handle,
}

impl Worker for ComfyWorker {
    fn mode(&self) -> &str {
        &self.spec.name
    }

    fn run(
        &mut self,
        job: &Job,
        progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, WorkerError> {
        let plan = self.plan(job)?;
        let api = ComfyApi::new(self.endpoints.api_url.clone());
        let client = ComfyClient::new(
            self.endpoints.ws_url.clone(),
            self.endpoints.api_url.clone(),
        );
        self.rt.clone().block_on(execute(
            &api,
            &client,
            plan,
            job.id.clone(),
            job.init_image.clone(),
            progress,
            cancel,
        ))
    }

    fn unload(&mut self) {
        // The model is resident on the ComfyUI side; switching modes just
        // changes which checkpoint the rendered workflows name.
        tracing::debug!(mode = %self.spec.name, "ComfyUI worker unloaded");
    }
}

impl ComfyWorker {
    /// Pick the workflow for a job and collect its substitutions.
    fn plan(&self, job: &Job) -> Result<RenderPlan, WorkerError> {
        match &job.payload {
            JobPayload::Generate(p) | JobPayload::DreamTick(p) => {
                let workflow = self
                    .workflows
                    .get(self.workflows.default_workflow())
                    .map_err(|e| WorkerError::Failure(e.message))?;
                let vars = Vars::new()
                    .set("model", self.spec.model.as_str())
                    .set("prompt", p.prompt.as_str())
                    .set("seed", p.seed)
                    .set("steps", p.steps)
                    .set("cfg", p.cfg)
                    .set("width", p.size.width)
                    .set("height", p.size.height)
                    .set("denoise", p.denoise_strength)
                    .set("magnitude", u64::from(p.superres_magnitude));
                Ok(RenderPlan {
                    workflow: workflow.workflow.clone(),
                    vars,
                    seed: Some(p.seed),
                    did_superres: p.superres,
                })
            }
            JobPayload::Sr(p) => {
                let workflow = self.workflows.get(SR_WORKFLOW).map_err(|_| {
                    WorkerError::Failure(format!(
                        "super-resolution needs a '{SR_WORKFLOW}' workflow in the catalogue"
                    ))
                })?;
                let vars = Vars::new().set("magnitude", u64::from(p.magnitude));
                Ok(RenderPlan {
                    workflow: workflow.workflow.clone(),
                    vars,
                    seed: None,
                    did_superres: true,
                })
            }
            JobPayload::Comfy(p) => {
                let workflow = self
                    .workflows
                    .get(&p.workflow_id)
                    .map_err(|e| WorkerError::Failure(e.message))?;
                let mut vars = Vars::new().set("model", self.spec.model.as_str());
                if let Some(params) = p.params.as_object() {
                    for (key, value) in params {
                        vars = vars.set(key, value.clone());
                    }
                }
                Ok(RenderPlan {
                    workflow: workflow.workflow.clone(),
                    vars,
                    seed: None,
                    did_superres: false,
                })
            }
            JobPayload::ModeSwitch { .. } => Err(WorkerError::Failure(
                "mode switches are handled by the pool".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Async execution
// ---------------------------------------------------------------------------

async fn execute(
    api: &ComfyApi,
    client: &ComfyClient,
    plan: RenderPlan,
    job_id: String,
    init_image: Option<Vec<u8>>,
    progress: &mut ProgressFn<'_>,
    cancel: &CancellationToken,
) -> Result<RunOutput, WorkerError> {
    let mut conn = connect_with_backoff(client, &BackoffConfig::default(), cancel)
        .await
        .ok_or_else(|| {
            if cancel.is_cancelled() {
                WorkerError::Canceled
            } else {
                WorkerError::Failure(format!("cannot reach ComfyUI at {}", client.ws_url()))
            }
        })?;

    // Init images go up over HTTP first; the workflow references the
    // uploaded name.
    let mut vars = plan.vars;
    if let Some(bytes) = init_image {
        let name = api
            .upload_image(bytes, &format!("{job_id}.png"))
            .await
            .map_err(|e| WorkerError::Failure(format!("init image upload failed: {e}")))?;
        vars = vars.set("init_image", name);
    }

    let graph = render(&plan.workflow, &vars);
    let submitted = api
        .submit_prompt(&graph, &conn.client_id)
        .await
        .map_err(|e| WorkerError::Failure(format!("workflow submission failed: {e}")))?;
    let prompt_id = submitted.prompt_id;
    tracing::debug!(job_id = %job_id, prompt_id = %prompt_id, "Workflow submitted to ComfyUI");

    // Pump messages until our prompt completes or errors. The cancel
    // token is polled between frames; on cancel we interrupt whatever is
    // running and drop any queued copy.
    let mut last_fraction = 0.0_f64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = api.interrupt().await;
                let _ = api.delete_queued(&prompt_id).await;
                return Err(WorkerError::Canceled);
            }
            frame = conn.ws_stream.next() => {
                let Some(frame) = frame else {
                    return Err(WorkerError::Failure("ComfyUI connection closed mid-job".to_string()));
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        match parse_message(&text) {
                            Ok(ComfyMessage::Progress(data)) => {
                                last_fraction = data.fraction();
                                progress(ProgressUpdate {
                                    fraction: last_fraction,
                                    status: "generating".to_string(),
                                    detail: None,
                                });
                            }
                            Ok(ComfyMessage::Executing(data)) if data.prompt_id == prompt_id => {
                                match data.node {
                                    Some(node) => progress(ProgressUpdate {
                                        fraction: last_fraction,
                                        status: "generating".to_string(),
                                        detail: Some(serde_json::json!({ "node": node })),
                                    }),
                                    // node == None: the prompt finished.
                                    None => break,
                                }
                            }
                            Ok(ComfyMessage::ExecutionError(data)) if data.prompt_id == prompt_id => {
                                return Err(WorkerError::Failure(data.exception_message));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "Unparseable ComfyUI message");
                            }
                        }
                    }
                    // Binary frames are preview images; not surfaced.
                    Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        return Err(WorkerError::Failure("ComfyUI closed the connection".to_string()));
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        return Err(WorkerError::Failure(format!("WebSocket receive error: {e}")));
                    }
                }
            }
        }
    }

    // Completed: pull the first output image out of history.
    let history = api
        .history(&prompt_id)
        .await
        .map_err(|e| WorkerError::Failure(format!("history fetch failed: {e}")))?;
    let images = extract_output_images(&history, &prompt_id);
    let (filename, subfolder, folder_type) = images
        .into_iter()
        .next()
        .ok_or_else(|| WorkerError::Failure("workflow produced no output images".to_string()))?;

    let bytes = api
        .view(&filename, &subfolder, &folder_type)
        .await
        .map_err(|e| WorkerError::Failure(format!("output fetch failed: {e}")))?;

    progress(ProgressUpdate {
        fraction: 1.0,
        status: "done".to_string(),
        detail: None,
    });

    Ok(RunOutput {
        bytes,
        mime: "image/png".to_string(),
        seed: plan.seed,
        backend: "comfyui".to_string(),
        did_superres: plan.did_superres,
    })
}

/// Walk a `/history/{prompt_id}` document and collect output image
/// coordinates as `(filename, subfolder, type)` triples.
fn extract_output_images(history: &Value, prompt_id: &str) -> Vec<(String, String, String)> {
    let mut found = Vec::new();
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return found;
    };
    for node_output in outputs.values() {
        let Some(images) = node_output.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in images {
            let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                continue;
            };
            found.push((
                filename.to_string(),
                image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                image
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string(),
            ));
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn supported_backends() {
        assert!(backend_supported(Path::new("/models/sdxl.safetensors")));
        assert!(backend_supported(Path::new("/models/old.ckpt")));
        assert!(backend_supported(Path::new("/models/diffusers/sdxl-base")));
        assert!(!backend_supported(Path::new("/models/weights.bin")));
        assert!(!backend_supported(Path::new("/models/notes.txt")));
    }

    #[test]
    fn history_extraction_finds_images() {
        let history = json!({
            "p-1": {
                "outputs": {
                    "9": {
                        "images": [
                            { "filename": "out_00001_.png", "subfolder": "", "type": "output" }
                        ]
                    },
                    "12": { "text": ["not an image"] }
                }
            }
        });
        let images = extract_output_images(&history, "p-1");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0, "out_00001_.png");
        assert_eq!(images[0].2, "output");
    }

    #[test]
    fn history_extraction_tolerates_missing_prompt() {
        let images = extract_output_images(&json!({}), "ghost");
        assert!(images.is_empty());
    }
}
