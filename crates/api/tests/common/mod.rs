// Shared test helpers. Not every test binary uses every helper, so we
// suppress dead_code warnings at the module level.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tokio_util::sync::CancellationToken;

use darkroom_api::config::ServerConfig;
use darkroom_api::router::build_router;
use darkroom_api::state::AppState;
use darkroom_api::ws::WsManager;
use darkroom_core::job::{Job, JobPayload};
use darkroom_core::mode::{ModeConfig, ModeProvider, ModeSpec};
use darkroom_core::registry::{DeviceMemoryProbe, ModelRegistry};
use darkroom_core::workflow::WorkflowConfig;
use darkroom_engine::pool::{PoolOptions, WorkerPool};
use darkroom_engine::worker::{
    ProgressFn, ProgressUpdate, RunOutput, Worker, WorkerError, WorkerFactory,
};
use darkroom_engine::{BlobStore, DreamController, FileRefStore};
use darkroom_events::EventBus;

pub const FAKE_PNG: &[u8] = b"\x89PNG_fake_image_data";

// ---------------------------------------------------------------------------
// Config fixtures
// ---------------------------------------------------------------------------

const MODES_YAML: &str = r#"
default_mode: sdxl-base
model_root: /models
modes:
  sdxl-base:
    model: sdxl.safetensors
    default_size: 512x512
    default_steps: 4
    default_guidance: 1.0
  turbo:
    model: turbo.safetensors
"#;

const WORKFLOWS_YAML: &str = r#"
default_workflow: txt2img
workflows:
  txt2img:
    workflow:
      "1": { "class_type": "KSampler", "inputs": { "seed": "{seed}" } }
"#;

pub fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        modes_config: dir.path().join("modes.yaml").display().to_string(),
        workflows_config: dir.path().join("workflows.yaml").display().to_string(),
        queue_max: 64,
        job_timeout_secs: 30,
        request_deadline_secs: 10,
        comfy_ws_url: "ws://127.0.0.1:1".to_string(),
        comfy_api_url: "http://127.0.0.1:1".to_string(),
        otel_proxy_endpoint: None,
    }
}

// ---------------------------------------------------------------------------
// Mock worker
// ---------------------------------------------------------------------------

struct InstantWorker {
    mode: String,
    delay: Duration,
}

impl Worker for InstantWorker {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn run(
        &mut self,
        job: &Job,
        progress: &mut ProgressFn<'_>,
        cancel: &tokio_util::sync::CancellationToken,
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

    fn unload(&mut self) {}
}

pub struct MockFactory {
    delay: Duration,
}

impl WorkerFactory for MockFactory {
    fn build(&self, _worker_id: u32, spec: &ModeSpec) -> Result<Box<dyn Worker>, WorkerError> {
        Ok(Box::new(InstantWorker {
            mode: spec.name.clone(),
            delay: self.delay,
        }))
    }
}

struct FakeProbe;

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
// App assembly
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    // Keeps the config files alive for the test's duration.
    _dir: tempfile::TempDir,
}

pub fn build_test_app(worker_delay: Duration) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("modes.yaml"), MODES_YAML).unwrap();
    std::fs::write(dir.path().join("workflows.yaml"), WORKFLOWS_YAML).unwrap();

    let config = test_config(&dir);
    let modes = Arc::new(ModeConfig::load(&config.modes_config).expect("modes load"));
    let workflows =
        Arc::new(WorkflowConfig::load(&config.workflows_config).expect("workflows load"));
    let registry = Arc::new(ModelRegistry::new(Box::new(FakeProbe)));
    let bus = Arc::new(EventBus::default());
    let blobs = Arc::new(BlobStore::new());
    let filerefs = Arc::new(FileRefStore::default());

    let pool = WorkerPool::start(
        PoolOptions {
            queue_max: config.queue_max,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            initial_mode: Some(modes.default_mode()),
        },
        Arc::new(MockFactory {
            delay: worker_delay,
        }),
        Arc::clone(&modes) as Arc<dyn ModeProvider>,
        Arc::clone(&registry),
        Arc::clone(&blobs),
        Arc::clone(&bus),
    )
    .expect("pool start");

    let dream = Arc::new(DreamController::new(Arc::clone(&pool), Arc::clone(&bus)));

    let state = AppState {
        config: Arc::new(config),
        pool,
        ws: Arc::new(WsManager::new()),
        bus,
        registry,
        blobs,
        filerefs,
        dream,
        modes,
        workflows,
        http: reqwest::Client::new(),
    };

    TestApp {
        router: build_router(state.clone()),
        state,
        _dir: dir,
    }
}

/// Bind an ephemeral port and serve the app; returns the bound address.
pub async fn spawn_server(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

/// Spawn the bus-driven broadcaster so `queue:state` pushes flow in
/// end-to-end tests.
pub fn spawn_broadcasters(app: &TestApp) -> CancellationToken {
    let cancel = CancellationToken::new();
    darkroom_api::broadcast::spawn_event_broadcaster(app.state.clone(), cancel.clone());
    cancel
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn post_json(
    app: Router,
    uri: &str,
    body: serde_json::Value,
) -> axum::response::Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

/// POST a single-file multipart body to `/v1/upload`.
pub async fn post_multipart(app: Router, uri: &str, bytes: &[u8]) -> axum::response::Response {
    const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"input.png\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    app.oneshot(request).await.unwrap()
}
