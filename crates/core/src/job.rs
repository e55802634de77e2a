//! The job model: the central entity of the orchestration layer.
//!
//! A [`Job`] is created by the session router (or the dream controller),
//! queued, and then exclusively owned by the worker pool until it reaches
//! a terminal state. Parameter validation happens here, before a job is
//! ever constructed, so the pool only sees well-formed payloads.

pub use crate::types::JobId;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::hashing::sha256_hex;
use crate::types::Timestamp;

/// Hard ceiling on diffusion steps accepted from clients.
pub const MAX_STEPS: u32 = 150;
/// Hard ceiling on classifier-free guidance accepted from clients.
pub const MAX_CFG: f64 = 30.0;
/// Valid super-resolution magnitudes.
pub const SR_MAGNITUDE_RANGE: std::ops::RangeInclusive<u8> = 1..=4;
/// Smallest and largest accepted image edge, in pixels.
const MIN_EDGE: u32 = 64;
const MAX_EDGE: u32 = 4096;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority lane for the job queue. Lower values run first; ordering
/// within a lane is FIFO by submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "u8")]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
    Batch = 2,
    Background = 3,
}

/// Number of priority lanes.
pub const LANE_COUNT: usize = 4;

impl Priority {
    /// Index into the queue's lane array.
    pub fn lane(self) -> usize {
        self as usize
    }

    /// Parse a wire priority (0..=3).
    pub fn from_wire(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(Priority::Urgent),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Batch),
            3 => Ok(Priority::Background),
            other => Err(CoreError::bad_request(format!(
                "priority must be 0..=3, got {other}"
            ))),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// Transitions form a DAG with a single terminal per path:
/// `queued -> canceled` and `queued -> running -> {done, failed, canceled}`.
/// `canceling` is an observable intermediate between a cancel request and
/// the worker acknowledging it at its next poll point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Canceling,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Canceling)
                | (Running, Canceled)
                | (Canceling, Canceled)
                | (Canceling, Done)
                | (Canceling, Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Image size
// ---------------------------------------------------------------------------

/// Image dimensions parsed from the wire `"WxH"` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| CoreError::bad_request(format!("size must be WxH, got '{s}'")))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| CoreError::bad_request(format!("invalid width in size '{s}'")))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| CoreError::bad_request(format!("invalid height in size '{s}'")))?;
        for (name, v) in [("width", width), ("height", height)] {
            if !(MIN_EDGE..=MAX_EDGE).contains(&v) {
                return Err(CoreError::bad_request(format!(
                    "{name} must be {MIN_EDGE}..={MAX_EDGE}, got {v}"
                )));
            }
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Typed parameters
// ---------------------------------------------------------------------------

/// Fallback generation defaults, overridden per mode by the mode config.
#[derive(Debug, Clone, Copy)]
pub struct GenerateDefaults {
    pub size: ImageSize,
    pub steps: u32,
    pub guidance: f64,
}

impl Default for GenerateDefaults {
    fn default() -> Self {
        Self {
            size: ImageSize {
                width: 512,
                height: 512,
            },
            steps: 4,
            guidance: 1.0,
        }
    }
}

/// Validated parameters for a `generate` job.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub prompt: String,
    pub size: ImageSize,
    pub steps: u32,
    pub cfg: f64,
    pub seed: u64,
    pub superres: bool,
    pub superres_magnitude: u8,
    pub init_image_ref: Option<String>,
    pub denoise_strength: f64,
}

impl GenerateParams {
    /// Parse raw envelope params, applying mode defaults for anything
    /// the client omitted. A missing seed gets a fresh random one so the
    /// resulting job is fully reproducible from its own record.
    pub fn from_value(params: &Value, defaults: &GenerateDefaults) -> Result<Self, CoreError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::bad_request("missing required param: prompt"))?
            .to_string();

        let size = match params.get("size").and_then(Value::as_str) {
            Some(s) => ImageSize::parse(s)?,
            None => defaults.size,
        };

        // Accept both the short wire names and the long-form aliases.
        let steps = opt_u64(params, &["steps", "num_inference_steps"])?
            .map(|v| v as u32)
            .unwrap_or(defaults.steps);
        if !(1..=MAX_STEPS).contains(&steps) {
            return Err(CoreError::bad_request(format!(
                "steps must be 1..={MAX_STEPS}, got {steps}"
            )));
        }

        let cfg = opt_f64(params, &["cfg", "guidance_scale"])?.unwrap_or(defaults.guidance);
        if !(0.0..=MAX_CFG).contains(&cfg) {
            return Err(CoreError::bad_request(format!(
                "cfg must be 0..={MAX_CFG}, got {cfg}"
            )));
        }

        let seed = match opt_u64(params, &["seed"])? {
            Some(seed) => seed,
            None => rand::rng().random(),
        };

        let superres = params
            .get("superres")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let superres_magnitude =
            opt_u64(params, &["superres_magnitude"])?.map(|v| v as u8).unwrap_or(2);
        if !SR_MAGNITUDE_RANGE.contains(&superres_magnitude) {
            return Err(CoreError::bad_request(format!(
                "superres_magnitude must be 1..=4, got {superres_magnitude}"
            )));
        }

        let init_image_ref = params
            .get("init_image_ref")
            .and_then(Value::as_str)
            .map(strip_file_ref_prefix);

        let denoise_strength = opt_f64(params, &["denoise_strength"])?.unwrap_or(0.75);
        if !(0.0..=1.0).contains(&denoise_strength) {
            return Err(CoreError::bad_request(format!(
                "denoise_strength must be 0..=1, got {denoise_strength}"
            )));
        }

        Ok(Self {
            prompt,
            size,
            steps,
            cfg,
            seed,
            superres,
            superres_magnitude,
            init_image_ref,
            denoise_strength,
        })
    }

    /// Canonical fingerprint over everything that determines the output.
    /// Identical inputs yield the identical content-addressed key.
    pub fn fingerprint(&self) -> String {
        let canon = format!(
            "generate|{}|{}|{}|{:.4}|{}|{}|{}",
            self.prompt,
            self.size,
            self.steps,
            self.cfg,
            self.seed,
            self.superres,
            self.superres_magnitude,
        );
        sha256_hex(canon.as_bytes())
    }
}

/// Validated parameters for a standalone super-resolution job.
#[derive(Debug, Clone)]
pub struct SrParams {
    pub init_image_ref: String,
    pub magnitude: u8,
}

impl SrParams {
    pub fn from_value(params: &Value) -> Result<Self, CoreError> {
        let init_image_ref = params
            .get("init_image_ref")
            .or_else(|| params.get("fileRef"))
            .and_then(Value::as_str)
            .map(strip_file_ref_prefix)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| CoreError::bad_request("missing required param: init_image_ref"))?;

        let magnitude = opt_u64(params, &["magnitude"])?.map(|v| v as u8).unwrap_or(2);
        if !SR_MAGNITUDE_RANGE.contains(&magnitude) {
            return Err(CoreError::bad_request(format!(
                "magnitude must be 1..=4, got {magnitude}"
            )));
        }

        Ok(Self {
            init_image_ref,
            magnitude,
        })
    }

    /// SR output identity depends on the input bytes, not a ref that
    /// expires, so the fingerprint hashes the resolved image.
    pub fn fingerprint(&self, input: &[u8]) -> String {
        let canon = format!("sr|{}|{}", sha256_hex(input), self.magnitude);
        sha256_hex(canon.as_bytes())
    }
}

/// Validated parameters for a `comfy` workflow job.
#[derive(Debug, Clone)]
pub struct ComfyParams {
    pub workflow_id: String,
    pub params: Value,
    pub input_image_ref: Option<String>,
}

impl ComfyParams {
    pub fn from_envelope(msg: &Value) -> Result<Self, CoreError> {
        let workflow_id = msg
            .get("workflowId")
            .and_then(Value::as_str)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| CoreError::bad_request("missing required param: workflowId"))?
            .to_string();

        let params = msg.get("params").cloned().unwrap_or(Value::Object(Default::default()));
        if !params.is_object() {
            return Err(CoreError::bad_request("params must be an object"));
        }

        let input_image_ref = msg
            .get("inputImage")
            .and_then(Value::as_str)
            .map(strip_file_ref_prefix)
            .filter(|r| !r.is_empty());

        Ok(Self {
            workflow_id,
            params,
            input_image_ref,
        })
    }

    pub fn fingerprint(&self, input: Option<&[u8]>) -> String {
        let canon = format!(
            "comfy|{}|{}|{}",
            self.workflow_id,
            self.params,
            input.map(sha256_hex).unwrap_or_default(),
        );
        sha256_hex(canon.as_bytes())
    }
}

/// Strip the optional `fileRef:` prefix clients sometimes include.
fn strip_file_ref_prefix(s: &str) -> String {
    s.strip_prefix("fileRef:").unwrap_or(s).to_string()
}

// ---------------------------------------------------------------------------
// Payload union
// ---------------------------------------------------------------------------

/// Tagged union over the job types the pool executes.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Generate(GenerateParams),
    Sr(SrParams),
    Comfy(ComfyParams),
    ModeSwitch { mode: String },
    /// A generate job minted by the dream controller. Identical execution
    /// path to `Generate`; kept distinct so queue snapshots and events can
    /// attribute it.
    DreamTick(GenerateParams),
}

impl JobPayload {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::Generate(_) => "generate",
            JobPayload::Sr(_) => "sr",
            JobPayload::Comfy(_) => "comfy",
            JobPayload::ModeSwitch { .. } => "modeSwitch",
            JobPayload::DreamTick(_) => "dreamTick",
        }
    }

    /// The file reference this payload needs resolved before execution,
    /// if any.
    pub fn init_image_ref(&self) -> Option<&str> {
        match self {
            JobPayload::Generate(p) | JobPayload::DreamTick(p) => p.init_image_ref.as_deref(),
            JobPayload::Sr(p) => Some(&p.init_image_ref),
            JobPayload::Comfy(p) => p.input_image_ref.as_deref(),
            JobPayload::ModeSwitch { .. } => None,
        }
    }

    /// Parse and validate an inbound submit envelope into a payload.
    ///
    /// Unknown job types are a `BadRequest`: no job is created.
    pub fn parse(
        job_type: &str,
        msg: &Value,
        params: &Value,
        defaults: &GenerateDefaults,
    ) -> Result<Self, CoreError> {
        match job_type {
            "generate" => Ok(JobPayload::Generate(GenerateParams::from_value(
                params, defaults,
            )?)),
            "sr" => Ok(JobPayload::Sr(SrParams::from_value(params)?)),
            "comfy" => Ok(JobPayload::Comfy(ComfyParams::from_envelope(msg)?)),
            "modeSwitch" => {
                let mode = params
                    .get("mode")
                    .or_else(|| msg.get("mode"))
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| CoreError::bad_request("missing required param: mode"))?;
                Ok(JobPayload::ModeSwitch {
                    mode: mode.to_string(),
                })
            }
            other => Err(CoreError::bad_request(format!("unknown jobType: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Where a job came from, for queue snapshots and operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Ws,
    Http,
    Dream,
}

/// The central entity: one unit of work against the accelerator.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Client-chosen correlation id, echoed on `job:ack`.
    pub corr_id: Option<String>,
    pub payload: JobPayload,
    pub priority: Priority,
    pub source: JobSource,
    pub submitted_at: Timestamp,
    /// Init image bytes, resolved from the file-ref store before submit.
    pub init_image: Option<Vec<u8>>,
}

impl Job {
    pub fn new(payload: JobPayload, priority: Priority, source: JobSource) -> Self {
        Self {
            id: crate::types::new_job_id(),
            corr_id: None,
            payload,
            priority,
            source,
            submitted_at: chrono::Utc::now(),
            init_image: None,
        }
    }

    pub fn with_corr_id(mut self, corr_id: Option<String>) -> Self {
        self.corr_id = corr_id;
        self
    }

    pub fn with_init_image(mut self, bytes: Option<Vec<u8>>) -> Self {
        self.init_image = bytes;
        self
    }

    pub fn job_type(&self) -> &'static str {
        self.payload.job_type()
    }
}

/// Lightweight row describing a queued or running job, used by
/// `queue:state` pushes and admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobDescriptor {
    pub id: JobId,
    #[serde(rename = "jobType")]
    pub job_type: &'static str,
    pub priority: Priority,
    pub source: JobSource,
    pub state: JobState,
    #[serde(rename = "submittedAt")]
    pub submitted_at: Timestamp,
}

impl From<&Job> for JobDescriptor {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type(),
            priority: job.priority,
            source: job.source,
            state: JobState::Queued,
            submitted_at: job.submitted_at,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Read the first present key as a non-negative integer.
fn opt_u64(params: &Value, keys: &[&str]) -> Result<Option<u64>, CoreError> {
    for key in keys {
        if let Some(v) = params.get(*key) {
            if v.is_null() {
                continue;
            }
            return v
                .as_u64()
                .map(Some)
                .ok_or_else(|| CoreError::bad_request(format!("{key} must be a non-negative integer")));
        }
    }
    Ok(None)
}

/// Read the first present key as a float.
fn opt_f64(params: &Value, keys: &[&str]) -> Result<Option<f64>, CoreError> {
    for key in keys {
        if let Some(v) = params.get(*key) {
            if v.is_null() {
                continue;
            }
            return v
                .as_f64()
                .map(Some)
                .ok_or_else(|| CoreError::bad_request(format!("{key} must be a number")));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
