//! Mode administration: list, switch, reload, and VRAM visibility.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use darkroom_core::mode::ModeProvider;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/modes
pub async fn list_modes(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut modes = serde_json::Map::new();
    for name in state.modes.list() {
        let spec = state.modes.get(&name).map_err(AppError::Core)?;
        modes.insert(
            name,
            json!({
                "model": spec.model,
                "loras": spec
                    .loras
                    .iter()
                    .map(|l| json!({ "path": l.path, "strength": l.strength }))
                    .collect::<Vec<_>>(),
                "default_size": spec.default_size.to_string(),
                "default_steps": spec.default_steps,
                "default_guidance": spec.default_guidance,
            }),
        );
    }

    Ok(Json(json!({
        "default_mode": state.modes.default_mode(),
        "modes": modes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ModeSwitchRequest {
    pub mode: String,
}

/// POST /api/modes/switch
///
/// Queues the switch at urgent priority and waits for it to land.
/// Switching to the loaded mode answers immediately.
pub async fn switch_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeSwitchRequest>,
) -> AppResult<Json<Value>> {
    let from = state.pool.current_mode();
    if from.as_deref() == Some(request.mode.as_str()) {
        return Ok(Json(json!({
            "status": "already_loaded",
            "mode": request.mode,
        })));
    }

    let ticket = state.pool.switch_mode(&request.mode).map_err(AppError::Core)?;
    ticket.wait().await.map_err(AppError::Core)?;

    tracing::info!(from = ?from, to = %request.mode, "Mode switch completed");
    Ok(Json(json!({
        "status": "switched",
        "from_mode": from,
        "to_mode": request.mode,
    })))
}

/// POST /api/modes/reload
///
/// Re-read the modes document from disk. On parse failure the previous
/// catalogue stays in effect and the error is surfaced.
pub async fn reload_modes(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let count = state.modes.reload().map_err(AppError::Core)?;
    Ok(Json(json!({
        "status": "reloaded",
        "modes_count": count,
        "modes": state.modes.list(),
        "default_mode": state.modes.default_mode(),
    })))
}

/// GET /api/vram
pub async fn vram_stats(State(state): State<AppState>) -> Json<DataResponse<Value>> {
    Json(DataResponse {
        data: serde_json::to_value(state.registry.stats()).unwrap_or(Value::Null),
    })
}

/// GET /api/models/status
pub async fn models_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "current_mode": state.pool.current_mode(),
        "queue_size": state.pool.queue_len(),
        "vram": state.registry.stats(),
    }))
}
