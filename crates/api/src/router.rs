//! Route tree for the HTTP/WS surface.
//!
//! ```text
//! /v1/ws                     WebSocket control channel
//! /v1/upload                 multipart upload -> fileRef
//! /storage/{key}             content-addressed output blobs
//! /healthz                   status snapshot
//!
//! /generate                  legacy blocking generate adapter
//! /superres                  legacy blocking super-resolution adapter
//!
//! /api/modes                 list modes
//! /api/modes/switch          switch mode (POST)
//! /api/modes/reload          reload modes.yaml (POST)
//! /api/vram                  VRAM stats
//! /api/models/status         current mode + queue + VRAM
//! ```

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ws", get(ws::ws_handler))
        .route("/v1/upload", post(handlers::upload::upload))
        .route("/storage/{key}", get(handlers::storage::get_blob))
        .route("/healthz", get(handlers::health::healthz))
        .route("/generate", post(handlers::generate::generate))
        .route("/superres", post(handlers::generate::superres))
        .route("/api/modes", get(handlers::modes::list_modes))
        .route("/api/modes/switch", post(handlers::modes::switch_mode))
        .route("/api/modes/reload", post(handlers::modes::reload_modes))
        .route("/api/vram", get(handlers::modes::vram_stats))
        .route("/api/models/status", get(handlers::modes::models_status))
        .with_state(state)
}
