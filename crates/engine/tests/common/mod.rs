//! Shared fixtures for engine integration tests: a fake mode catalogue,
//! an instrumented worker factory, and a pool harness.

// Shared between test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use darkroom_core::error::CoreError;
use darkroom_core::job::{
    GenerateDefaults, GenerateParams, ImageSize, Job, JobPayload, JobSource, Priority,
};
use darkroom_core::mode::{ModeProvider, ModeSpec};
use darkroom_core::registry::{DeviceMemoryProbe, ModelRegistry};
use darkroom_engine::pool::{PoolOptions, WorkerPool};
use darkroom_engine::worker::{
    ProgressFn, ProgressUpdate, RunOutput, Worker, WorkerError, WorkerFactory,
};
use darkroom_engine::BlobStore;
use darkroom_events::EventBus;
use serde_json::json;

pub const FAKE_PNG: &[u8] = b"\x89PNG_fake_image_data";

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Two modes: mode-a (SDXL-flavored) and mode-b (SD1.5-flavored).
pub struct FixtureModes;

fn spec(name: &str, model: &str, size: &str, steps: u32, guidance: f64) -> ModeSpec {
    ModeSpec {
        name: name.to_string(),
        model: model.to_string(),
        model_path: format!("/models/{model}").into(),
        loras: vec![],
        default_size: ImageSize::parse(size).unwrap(),
        default_steps: steps,
        default_guidance: guidance,
    }
}

impl ModeProvider for FixtureModes {
    fn get(&self, name: &str) -> Result<ModeSpec, CoreError> {
        match name {
            "mode-a" => Ok(spec("mode-a", "sdxl.safetensors", "1024x1024", 30, 7.5)),
            "mode-b" => Ok(spec("mode-b", "sd15.safetensors", "512x512", 4, 1.0)),
            other => Err(CoreError::mode_not_found(other, &self.list())),
        }
    }

    fn default_mode(&self) -> String {
        "mode-a".to_string()
    }

    fn list(&self) -> Vec<String> {
        vec!["mode-a".to_string(), "mode-b".to_string()]
    }
}

// ---------------------------------------------------------------------------
// Device probe
// ---------------------------------------------------------------------------

pub struct FakeProbe;

impl DeviceMemoryProbe for FakeProbe {
    fn used_bytes(&self) -> u64 {
        1 << 30
    }
    fn total_bytes(&self) -> u64 {
        8 << 30
    }
    fn device_name(&self) -> String {
        "FakeGPU 9000".to_string()
    }
}

// ---------------------------------------------------------------------------
// Worker + factory
// ---------------------------------------------------------------------------

/// Worker that sleeps `delay` in four cancel-polled slices, reports
/// progress, and returns fake PNG bytes.
pub struct MockWorker {
    mode: String,
    delay: Duration,
    unloads: Arc<AtomicU32>,
}

impl Worker for MockWorker {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn run(
        &mut self,
        job: &Job,
        progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, WorkerError> {
        const STEPS: u32 = 4;
        let per_step = self.delay / STEPS;
        for step in 0..STEPS {
            if cancel.is_cancelled() {
                return Err(WorkerError::Canceled);
            }
            if !per_step.is_zero() {
                std::thread::sleep(per_step);
            }
            progress(ProgressUpdate {
                fraction: f64::from(step + 1) / f64::from(STEPS),
                status: "denoising".to_string(),
                detail: None,
            });
        }
        let seed = match &job.payload {
            JobPayload::Generate(p) | JobPayload::DreamTick(p) => Some(p.seed),
            _ => None,
        };
        Ok(RunOutput {
            bytes: FAKE_PNG.to_vec(),
            mime: "image/png".to_string(),
            seed,
            backend: "mock".to_string(),
            did_superres: false,
        })
    }

    fn unload(&mut self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory that counts builds/unloads and can be told to fail.
pub struct MockFactory {
    pub builds: AtomicU32,
    pub unloads: Arc<AtomicU32>,
    pub fail_builds: AtomicBool,
    pub delay: Mutex<Duration>,
}

impl MockFactory {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicU32::new(0),
            unloads: Arc::new(AtomicU32::new(0)),
            fail_builds: AtomicBool::new(false),
            delay: Mutex::new(delay),
        })
    }
}

impl WorkerFactory for MockFactory {
    fn build(&self, _worker_id: u32, spec: &ModeSpec) -> Result<Box<dyn Worker>, WorkerError> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(WorkerError::LoadFailed(format!(
                "cannot load {}",
                spec.model
            )));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockWorker {
            mode: spec.name.clone(),
            delay: *self.delay.lock().unwrap(),
            unloads: Arc::clone(&self.unloads),
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub pool: Arc<WorkerPool>,
    pub factory: Arc<MockFactory>,
    pub registry: Arc<ModelRegistry>,
    pub blobs: Arc<BlobStore>,
    pub bus: Arc<EventBus>,
}

pub fn harness(initial_mode: Option<&str>, worker_delay: Duration) -> Harness {
    harness_with(initial_mode, worker_delay, PoolOptions::default())
}

pub fn harness_with(
    initial_mode: Option<&str>,
    worker_delay: Duration,
    mut options: PoolOptions,
) -> Harness {
    let factory = MockFactory::new(worker_delay);
    let registry = Arc::new(ModelRegistry::new(Box::new(FakeProbe)));
    let blobs = Arc::new(BlobStore::new());
    let bus = Arc::new(EventBus::default());
    options.initial_mode = initial_mode.map(str::to_string);

    let pool = WorkerPool::start(
        options,
        factory.clone(),
        Arc::new(FixtureModes),
        registry.clone(),
        blobs.clone(),
        bus.clone(),
    )
    .expect("pool should start");

    Harness {
        pool,
        factory,
        registry,
        blobs,
        bus,
    }
}

pub fn generate_job(prompt: &str, seed: u64) -> Job {
    let params = GenerateParams::from_value(
        &json!({"prompt": prompt, "seed": seed}),
        &GenerateDefaults::default(),
    )
    .unwrap();
    Job::new(JobPayload::Generate(params), Priority::Normal, JobSource::Ws)
}
