use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// POST /v1/upload
///
/// Multipart upload of a binary (init image, SR input). Returns a
/// `fileRef` valid for five minutes; the client threads it through a WS
/// submit envelope. Binary data deliberately never travels over the WS
/// control channel.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed reading upload: {e}")))?;
        if data.is_empty() {
            continue;
        }

        let reference = state.filerefs.put(data.to_vec(), &content_type);
        return Ok(Json(json!({ "fileRef": reference })));
    }

    Err(AppError::BadRequest("Empty upload".to_string()))
}
