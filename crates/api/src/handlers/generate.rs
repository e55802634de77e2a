//! Legacy blocking adapters, feature-parallel to the WS submit path.
//!
//! These synthesize a Job, submit it to the pool, and block on the
//! ticket until the deadline. They share no session state with the
//! control channel; clients that want progress streams use the
//! WebSocket.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use darkroom_core::error::{CoreError, ErrorKind};
use darkroom_core::job::{Job, JobPayload, JobSource, Priority, SrParams};
use darkroom_engine::pool::JobTicket;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OutputFormat {
    /// `json` returns `{key, url, meta}` instead of the image bytes.
    #[serde(default)]
    pub format: Option<String>,
}

/// POST /generate
///
/// Body: the same params object the WS `job:submit` carries for
/// `jobType: "generate"`.
pub async fn generate(
    State(state): State<AppState>,
    Query(output): Query<OutputFormat>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let defaults = state.generate_defaults();
    let payload = JobPayload::parse("generate", &body, &body, &defaults).map_err(AppError::Core)?;

    let init_image = match payload.init_image_ref() {
        Some(reference) => Some(state.filerefs.take(reference).map_err(AppError::Core)?),
        None => None,
    };

    let job = Job::new(payload, Priority::Normal, JobSource::Http).with_init_image(init_image);
    let ticket = state.pool.submit(job).map_err(AppError::Core)?;

    finish(&state, ticket, output.format.as_deref()).await
}

#[derive(Debug, Deserialize)]
pub struct SuperresRequest {
    /// Upload ref from `POST /v1/upload`.
    #[serde(alias = "fileRef")]
    pub init_image_ref: String,
    #[serde(default = "default_magnitude")]
    pub magnitude: u8,
    #[serde(default)]
    pub format: Option<String>,
}

fn default_magnitude() -> u8 {
    2
}

/// POST /superres
pub async fn superres(
    State(state): State<AppState>,
    Json(request): Json<SuperresRequest>,
) -> AppResult<Response> {
    let params = SrParams::from_value(&json!({
        "init_image_ref": request.init_image_ref,
        "magnitude": request.magnitude,
    }))
    .map_err(AppError::Core)?;

    let bytes = state
        .filerefs
        .take(&params.init_image_ref)
        .map_err(AppError::Core)?;

    let job = Job::new(JobPayload::Sr(params), Priority::Normal, JobSource::Http)
        .with_init_image(Some(bytes));
    let ticket = state.pool.submit(job).map_err(AppError::Core)?;

    finish(&state, ticket, request.format.as_deref()).await
}

/// Await the ticket within the configured deadline and shape the reply.
async fn finish(
    state: &AppState,
    ticket: JobTicket,
    format: Option<&str>,
) -> AppResult<Response> {
    let job_id = ticket.job_id.clone();
    let deadline = state.config.request_deadline();

    let outcome = tokio::time::timeout(deadline, ticket.wait())
        .await
        .map_err(|_| {
            // Deadline passed: give up on the request and cancel the job,
            // mirroring what a WS client does at its own deadline.
            state.pool.cancel(&job_id);
            AppError::Core(CoreError::new(
                ErrorKind::Timeout,
                format!("no result within {}s", deadline.as_secs()),
            ))
        })?;

    let success = outcome.map_err(AppError::Core)?;

    if format == Some("json") {
        return Ok(Json(json!({
            "jobId": job_id,
            "outputs": success.outputs,
            "meta": success.meta,
        }))
        .into_response());
    }

    let key = &success.outputs.first().ok_or_else(|| {
        AppError::InternalError("job completed without outputs".to_string())
    })?
    .key;
    let blob = state
        .blobs
        .get(key)
        .ok_or_else(|| AppError::InternalError(format!("blob {key} missing after completion")))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, blob.mime.clone()),
            (header::ETAG, format!("\"{key}\"")),
        ],
        blob.bytes,
    )
        .into_response())
}
