//! The worker seam: the pool executes jobs against anything implementing
//! [`Worker`], and builds workers through an injected [`WorkerFactory`].
//!
//! Workers are blocking and single-threaded by contract -- they own the
//! accelerator and nothing else touches it. Cancellation is cooperative:
//! the worker polls the token between diffusion steps (or protocol
//! messages) and returns [`WorkerError::Canceled`] when it fires.

use tokio_util::sync::CancellationToken;

use darkroom_core::error::CoreError;
use darkroom_core::job::Job;
use darkroom_core::mode::ModeSpec;
use darkroom_events::{JobMeta, OutputRef};

/// A progress report from inside a running job.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Completion fraction in `[0, 1]`.
    pub fraction: f64,
    /// Short human-readable phase, e.g. `"denoising"`.
    pub status: String,
    /// Optional backend-specific payload (current node, step index, ...).
    pub detail: Option<serde_json::Value>,
}

/// Result of a successful `run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub bytes: Vec<u8>,
    pub mime: String,
    /// The seed actually used, when the job type has one.
    pub seed: Option<u64>,
    /// Backend identifier surfaced in `job:complete` meta.
    pub backend: String,
    pub did_superres: bool,
}

/// Worker-level failures. The pool maps these onto the wire taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The cancel token fired and the worker stopped at a poll point.
    #[error("canceled")]
    Canceled,

    /// No worker is loaded (mode was unloaded, or initial load skipped).
    #[error("no worker available")]
    NotLoaded,

    /// The worker could not be constructed for a mode.
    #[error("model load failed: {0}")]
    LoadFailed(String),

    /// Anything else the backend raised while executing.
    #[error("{0}")]
    Failure(String),
}

/// Callback invoked zero or more times during `run`, from the worker's
/// own thread. Implementations must not block.
pub type ProgressFn<'a> = dyn FnMut(ProgressUpdate) + 'a;

/// A loaded model bound to one accelerator.
pub trait Worker: Send {
    /// The mode this worker was built for.
    fn mode(&self) -> &str;

    /// Execute one job to completion, reporting progress and polling the
    /// cancel token between steps.
    fn run(
        &mut self,
        job: &Job,
        progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, WorkerError>;

    /// Release the model and any device caches. Called before the worker
    /// is dropped on mode switches and shutdown.
    fn unload(&mut self);
}

/// Builds workers for modes. The default implementation inspects the
/// mode's model files to pick a concrete backend; tests substitute
/// fixtures. The pool never names a concrete worker type.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, worker_id: u32, spec: &ModeSpec) -> Result<Box<dyn Worker>, WorkerError>;
}

/// Successful terminal outcome delivered through a job ticket.
#[derive(Debug, Clone)]
pub struct JobSuccess {
    pub outputs: Vec<OutputRef>,
    pub meta: JobMeta,
}

/// What a submitted job ultimately resolved to.
pub type JobOutcome = Result<JobSuccess, CoreError>;
