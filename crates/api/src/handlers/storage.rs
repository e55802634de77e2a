use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use crate::state::AppState;

/// GET /storage/{key}
///
/// Serve a content-addressed output blob. Keys are stable under
/// identical generation inputs, so clients may cache indefinitely.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.blobs.get(&key) {
        Some(blob) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, blob.mime),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=31536000, immutable".to_string(),
                ),
            ],
            blob.bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
