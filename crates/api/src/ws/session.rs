//! The session router: one WebSocket connection's lifecycle.
//!
//! Each session runs three tasks after upgrade: a sender pump (manager
//! channel -> sink), an event fan-out (engine bus -> frames for jobs this
//! session owns), and the inbound dispatch loop on the handler task.
//!
//! Ordering per jobId is `job:ack`, zero or more `job:progress`, then
//! exactly one terminal (`job:complete` | `job:error` | `job:cancel`).
//! The ack is sent before the job reaches the pool and all later events
//! flow through the single fan-out task, which preserves bus order.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use darkroom_core::error::ErrorKind;
use darkroom_core::hashing::sha256_hex;
use darkroom_core::job::{GenerateParams, Job, JobPayload, JobSource, Priority};
use darkroom_engine::dream::DreamStartParams;

use crate::broadcast::build_status;
use crate::state::AppState;
use crate::ws::manager::SessionShared;
use crate::ws::protocol::{job_event_message, ServerMessage};

/// Sessions with no inbound frame for this long are closed. Clients are
/// expected to ping at least every 30 seconds.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single WebSocket session after upgrade.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    tracing::info!(session_id = %session_id, "WebSocket session connected");

    let (mut rx, shared) = state.ws.add(session_id.clone()).await;
    let (mut sink, mut stream) = socket.split();

    // Sender pump: forward manager-channel frames to the socket sink.
    let pump_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                tracing::debug!(session_id = %pump_session, "WebSocket sink closed");
                break;
            }
        }
    });

    // Event fan-out: forward engine events for jobs this session owns.
    let fanout_task = tokio::spawn(event_fanout(
        state.clone(),
        session_id.clone(),
        Arc::clone(&shared),
    ));

    // Greet with a status snapshot.
    state
        .ws
        .send_to(&session_id, status_frame(&state).await)
        .await;

    // Inbound loop with idle timeout.
    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                tracing::info!(session_id = %session_id, "Session idle past 60s, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                dispatch_text(&state, &session_id, &shared, &text).await;
            }
            Message::Close(_) => break,
            // Pings are answered by the transport; both directions count
            // as liveness and reset the idle timer above.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    // Cleanup: the session's jobs keep running (outputs stay retrievable
    // over HTTP by key), but an owned dream session stops.
    state.ws.remove(&session_id).await;
    state.dream.stop_if_owner(&session_id).await;
    send_task.abort();
    fanout_task.abort();
    tracing::info!(session_id = %session_id, "WebSocket session disconnected");
}

/// Forward job events from the engine bus to this session, enforcing the
/// per-job ordering and unsubscribing at the terminal.
async fn event_fanout(state: AppState, session_id: String, shared: Arc<SessionShared>) {
    let mut rx = state.bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(job_id) = event.job_id().cloned() else {
                    continue;
                };
                if !shared.owns(&job_id) {
                    continue;
                }
                if let Some(message) = job_event_message(&event) {
                    state.ws.send_to(&session_id, message.frame()).await;
                }
                if event.is_terminal() {
                    shared.release_job(&job_id);
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                // Slow consumer: progress frames coalesce by dropping the
                // oldest buffered events.
                tracing::warn!(session_id = %session_id, skipped, "Session fan-out lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn status_frame(state: &AppState) -> Message {
    Message::Text(build_status(state).await.to_string().into())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch_text(state: &AppState, session_id: &str, shared: &Arc<SessionShared>, raw: &str) {
    let msg: Value = match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            let reply = ServerMessage::error(ErrorKind::BadRequest, "Invalid JSON", None, None);
            state.ws.send_to(session_id, reply.frame()).await;
            return;
        }
    };

    let corr_id = msg.get("id").and_then(Value::as_str).map(str::to_string);
    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();

    let reply = match msg_type {
        "ping" => Some(ServerMessage::Pong),
        "job:submit" => handle_submit(state, session_id, shared, &msg, corr_id.clone()).await,
        "job:cancel" => handle_cancel(state, shared, &msg).await,
        "job:priority" => handle_priority(state, &msg, corr_id.clone()),
        "dream:start" => handle_dream_start(state, session_id, &msg, corr_id.clone()),
        "dream:stop" => handle_dream_stop(state, corr_id.clone()).await,
        "dream:status" => Some(ServerMessage::DreamStatusReply {
            id: corr_id.clone(),
            status: state.dream.status(),
        }),
        "dream:top" => {
            let limit = msg.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
            Some(ServerMessage::DreamTopResult {
                id: corr_id.clone(),
                dreams: state.dream.top(limit),
            })
        }
        "dream:guide" => handle_dream_guide(state, &msg, corr_id.clone()),
        "storage:put" => handle_storage_put(state, &msg, corr_id.clone()),
        "telemetry:otlp" => handle_telemetry(state, &msg, corr_id.clone()).await,
        other => Some(ServerMessage::unknown_type(other, corr_id.clone())),
    };

    if let Some(reply) = reply {
        state.ws.send_to(session_id, reply.frame()).await;
    }
}

/// `job:submit`: validate, resolve the init image ref, ack, enqueue.
async fn handle_submit(
    state: &AppState,
    session_id: &str,
    shared: &Arc<SessionShared>,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let job_type = msg
        .get("jobType")
        .and_then(Value::as_str)
        .unwrap_or("generate");
    let params = msg
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let defaults = state.generate_defaults();
    let payload = match JobPayload::parse(job_type, msg, &params, &defaults) {
        Ok(payload) => payload,
        Err(err) => return Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
    };

    // Comfy workflows are catalogue-bound; reject unknown ids before the
    // job exists.
    if let JobPayload::Comfy(p) = &payload {
        if let Err(err) = state.workflows.get(&p.workflow_id) {
            return Some(ServerMessage::error(err.kind, err.message, corr_id, None));
        }
    }

    let init_image = match payload.init_image_ref() {
        Some(reference) => match state.filerefs.take(reference) {
            Ok(bytes) => Some(bytes),
            Err(err) => return Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
        },
        None => None,
    };

    let priority = match &payload {
        JobPayload::ModeSwitch { .. } => Priority::Urgent,
        _ => Priority::Normal,
    };
    let job = Job::new(payload, priority, JobSource::Ws)
        .with_corr_id(corr_id.clone())
        .with_init_image(init_image);
    let job_id = job.id.clone();

    // Own the job and ack before it can start producing events, so the
    // ack always precedes the progress stream.
    shared.register_job(corr_id.clone(), &job_id);
    state
        .ws
        .send_to(
            session_id,
            ServerMessage::JobAck {
                id: corr_id.clone(),
                job_id: job_id.clone(),
            }
            .frame(),
        )
        .await;

    if let Err(err) = state.pool.submit(job) {
        shared.release_job(&job_id);
        return Some(ServerMessage::error(
            err.kind,
            err.message,
            corr_id,
            Some(job_id),
        ));
    }
    None
}

/// `job:cancel`: best-effort; only jobs this session owns are touched,
/// and canceling an already-terminal job is a silent no-op.
async fn handle_cancel(
    state: &AppState,
    shared: &Arc<SessionShared>,
    msg: &Value,
) -> Option<ServerMessage> {
    let Some(job_id) = msg.get("jobId").and_then(Value::as_str) else {
        return Some(ServerMessage::error(
            ErrorKind::BadRequest,
            "missing required field: jobId",
            msg.get("id").and_then(Value::as_str).map(str::to_string),
            None,
        ));
    };
    if shared.owns(job_id) {
        let delivered = state.pool.cancel(job_id);
        tracing::debug!(job_id, delivered, "Cancel requested");
    }
    None
}

fn handle_priority(
    state: &AppState,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let Some(job_id) = msg.get("jobId").and_then(Value::as_str) else {
        return Some(ServerMessage::error(
            ErrorKind::BadRequest,
            "missing required field: jobId",
            corr_id,
            None,
        ));
    };
    let raw = msg.get("priority").and_then(Value::as_u64).unwrap_or(1);
    let priority = match Priority::from_wire(raw.min(u64::from(u8::MAX)) as u8) {
        Ok(p) => p,
        Err(err) => return Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
    };
    let changed = state.pool.reprioritize(job_id, priority);
    tracing::debug!(job_id, changed, "Reprioritize requested");
    None
}

/// `dream:start`: fields may arrive top-level or nested under `params`.
fn handle_dream_start(
    state: &AppState,
    session_id: &str,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let p = msg.get("params").filter(|v| v.is_object()).unwrap_or(msg);

    let prompt = p
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let duration_hours = read_f64(p, &["durationHours", "duration_hours"]).unwrap_or(1.0);
    let temperature = read_f64(p, &["temperature"]).unwrap_or(0.5);
    let interval_ms = p
        .get("intervalMs")
        .or_else(|| p.get("interval_ms"))
        .and_then(Value::as_u64)
        .unwrap_or(5000);

    let params = DreamStartParams {
        prompt: prompt.clone(),
        duration_hours,
        temperature,
        interval_ms,
    };

    // Tick template: the current mode's defaults around the base prompt.
    let defaults = state.generate_defaults();
    let template = GenerateParams {
        prompt,
        size: defaults.size,
        steps: defaults.steps,
        cfg: defaults.guidance,
        seed: 0,
        superres: false,
        superres_magnitude: 2,
        init_image_ref: None,
        denoise_strength: 0.75,
    };

    match state
        .dream
        .start(params, template, Some(session_id.to_string()))
    {
        Ok(dream_session_id) => Some(ServerMessage::DreamStarted {
            id: corr_id,
            session_id: dream_session_id,
        }),
        Err(err) => Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
    }
}

async fn handle_dream_stop(state: &AppState, corr_id: Option<String>) -> Option<ServerMessage> {
    match state.dream.stop().await {
        Ok(stats) => Some(ServerMessage::DreamStopped { id: corr_id, stats }),
        Err(err) => Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
    }
}

fn handle_dream_guide(
    state: &AppState,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let p = msg.get("params").filter(|v| v.is_object()).unwrap_or(msg);
    let prompt = p.get("prompt").and_then(Value::as_str).map(str::to_string);
    let temperature = read_f64(p, &["temperature"]);

    match state.dream.guide(prompt, temperature) {
        Ok((prompt, temperature)) => Some(ServerMessage::DreamGuideAck {
            id: corr_id,
            prompt,
            temperature,
        }),
        Err(err) => Some(ServerMessage::error(err.kind, err.message, corr_id, None)),
    }
}

/// `storage:put`: small-object escape hatch -- a base64 payload stored
/// straight into the content-addressed output store. Bulk uploads go
/// over HTTP multipart.
fn handle_storage_put(
    state: &AppState,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let Some(data) = msg.get("data").and_then(Value::as_str) else {
        return Some(ServerMessage::error(
            ErrorKind::BadRequest,
            "missing required field: data (base64)",
            corr_id,
            None,
        ));
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => {
            return Some(ServerMessage::error(
                ErrorKind::BadRequest,
                "data must be non-empty base64",
                corr_id,
                None,
            ))
        }
    };
    let mime = msg
        .get("contentType")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream");

    let key = sha256_hex(&bytes);
    state.blobs.put(&key, bytes, mime);
    Some(ServerMessage::StorageAck {
        id: corr_id,
        url: format!("/storage/{key}"),
        key,
    })
}

/// `telemetry:otlp`: forward a client telemetry payload to the
/// configured collector, or no-op when none is configured.
async fn handle_telemetry(
    state: &AppState,
    msg: &Value,
    corr_id: Option<String>,
) -> Option<ServerMessage> {
    let Some(endpoint) = state.config.otel_proxy_endpoint.clone() else {
        return Some(ServerMessage::TelemetryAck {
            id: corr_id,
            status: "noop".to_string(),
        });
    };
    let Some(payload) = msg.get("payload") else {
        return Some(ServerMessage::error(
            ErrorKind::BadRequest,
            "Missing payload",
            corr_id,
            None,
        ));
    };
    let content_type = msg
        .get("contentType")
        .and_then(Value::as_str)
        .unwrap_or("application/json");

    let body = serde_json::to_vec(payload).unwrap_or_default();
    let result = state
        .http
        .post(&endpoint)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body)
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    match result {
        Ok(response) => Some(ServerMessage::TelemetryAck {
            id: corr_id,
            status: response.status().as_u16().to_string(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Telemetry collector unavailable");
            Some(ServerMessage::error(
                ErrorKind::WorkerFailure,
                "collector unavailable",
                corr_id,
                None,
            ))
        }
    }
}

fn read_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_f64))
}
