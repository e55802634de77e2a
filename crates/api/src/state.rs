use std::sync::Arc;

use darkroom_core::job::GenerateDefaults;
use darkroom_core::mode::{ModeConfig, ModeProvider};
use darkroom_core::registry::ModelRegistry;
use darkroom_core::workflow::WorkflowConfig;
use darkroom_engine::{BlobStore, DreamController, FileRefStore, WorkerPool};
use darkroom_events::EventBus;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all handlers via
/// `State<AppState>`. Cheaply cloneable: everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// The single worker pool driving the accelerator.
    pub pool: Arc<WorkerPool>,
    /// WebSocket session registry.
    pub ws: Arc<WsManager>,
    /// Engine event bus (job lifecycle, queue, dream).
    pub bus: Arc<EventBus>,
    /// VRAM accounting.
    pub registry: Arc<ModelRegistry>,
    /// Content-addressed generation outputs.
    pub blobs: Arc<BlobStore>,
    /// Short-TTL upload store.
    pub filerefs: Arc<FileRefStore>,
    /// The process-wide dream controller.
    pub dream: Arc<DreamController>,
    /// Mode catalogue (concrete type kept for admin reload).
    pub modes: Arc<ModeConfig>,
    /// ComfyUI workflow catalogue.
    pub workflows: Arc<WorkflowConfig>,
    /// Shared HTTP client (telemetry forwarding).
    pub http: reqwest::Client,
}

impl AppState {
    /// Generation defaults of the currently loaded mode, falling back to
    /// the built-in defaults when nothing is loaded.
    pub fn generate_defaults(&self) -> GenerateDefaults {
        self.pool
            .current_mode()
            .and_then(|mode| self.modes.get(&mode).ok())
            .map(|spec| spec.defaults())
            .unwrap_or_default()
    }
}
