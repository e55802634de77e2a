use axum::extract::State;
use axum::Json;

use crate::broadcast::build_status;
use crate::state::AppState;

/// GET /healthz
///
/// Always 200 while the process is serving; the body is the same
/// snapshot pushed as `system:status` on the control channel.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(build_status(&state).await)
}
