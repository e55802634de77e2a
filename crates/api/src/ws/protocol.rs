//! Typed outbound envelopes for the WebSocket protocol, plus the mapping
//! from engine events to per-session frames.
//!
//! All frames are JSON objects tagged by a `type` field shaped
//! `"domain:action"`. Inbound envelopes are dispatched from raw
//! `serde_json::Value`s in the session router (clients send free-form
//! params that each handler validates); outbound envelopes are typed
//! here so tests can pin the wire shape.

use axum::extract::ws::Message;
use serde::Serialize;

use darkroom_core::error::ErrorKind;
use darkroom_core::job::{JobDescriptor, JobState};
use darkroom_engine::dream::{DreamCandidate, DreamStatus};
use darkroom_events::{DreamStats, EngineEvent, JobMeta, OutputRef};

/// `progress` body on `job:progress` frames.
#[derive(Debug, Serialize)]
pub struct ProgressBody {
    pub fraction: f64,
}

/// Every frame the server emits on the control channel.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "job:ack")]
    JobAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(rename = "jobId")]
        job_id: String,
    },

    #[serde(rename = "job:progress")]
    JobProgress {
        #[serde(rename = "jobId")]
        job_id: String,
        status: String,
        progress: ProgressBody,
    },

    #[serde(rename = "job:complete")]
    JobComplete {
        #[serde(rename = "jobId")]
        job_id: String,
        outputs: Vec<OutputRef>,
        meta: JobMeta,
    },

    #[serde(rename = "job:cancel")]
    JobCancel {
        #[serde(rename = "jobId")]
        job_id: String,
    },

    #[serde(rename = "job:error")]
    JobError {
        #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
        kind: String,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "queue:state")]
    QueueState {
        pending: usize,
        running: usize,
        jobs: Vec<JobDescriptor>,
    },

    #[serde(rename = "dream:started")]
    DreamStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "dream:stopped")]
    DreamStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        stats: DreamStats,
    },

    #[serde(rename = "dream:status")]
    DreamStatusReply {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(flatten)]
        status: DreamStatus,
    },

    #[serde(rename = "dream:top:result")]
    DreamTopResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        dreams: Vec<DreamCandidate>,
    },

    #[serde(rename = "dream:guide:ack")]
    DreamGuideAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        prompt: String,
        temperature: f64,
    },

    #[serde(rename = "dream:candidate")]
    DreamCandidatePush {
        #[serde(rename = "jobId")]
        job_id: String,
        prompt: String,
        seed: u64,
        outputs: Vec<OutputRef>,
    },

    #[serde(rename = "storage:ack")]
    StorageAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        key: String,
        url: String,
    },

    #[serde(rename = "telemetry:ack")]
    TelemetryAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        status: String,
    },
}

impl ServerMessage {
    /// Serialize into a WebSocket text frame.
    pub fn frame(&self) -> Message {
        Message::Text(
            serde_json::to_string(self)
                .expect("server messages serialize")
                .into(),
        )
    }

    /// A `job:error` frame from a domain error kind.
    pub fn error(
        kind: ErrorKind,
        error: impl Into<String>,
        id: Option<String>,
        job_id: Option<String>,
    ) -> Self {
        ServerMessage::JobError {
            job_id,
            id,
            error: error.into(),
            kind: kind.as_str().to_string(),
        }
    }

    /// The `job:error` for an unrecognized envelope type.
    pub fn unknown_type(msg_type: &str, id: Option<String>) -> Self {
        ServerMessage::JobError {
            job_id: None,
            id,
            error: format!("Unknown type: {msg_type}"),
            kind: "UnknownType".to_string(),
        }
    }
}

/// Map a job-scoped engine event onto the frame the owning session
/// receives. Non-job events (queue, mode, dream) return `None`; the
/// broadcasters own those.
pub fn job_event_message(event: &EngineEvent) -> Option<ServerMessage> {
    match event {
        EngineEvent::JobStarted { job_id } => Some(ServerMessage::JobProgress {
            job_id: job_id.clone(),
            status: JobState::Running.to_string(),
            progress: ProgressBody { fraction: 0.0 },
        }),
        EngineEvent::JobProgress {
            job_id,
            fraction,
            status,
        } => Some(ServerMessage::JobProgress {
            job_id: job_id.clone(),
            status: status.clone(),
            progress: ProgressBody {
                fraction: *fraction,
            },
        }),
        EngineEvent::JobCompleted {
            job_id,
            outputs,
            meta,
        } => Some(ServerMessage::JobComplete {
            job_id: job_id.clone(),
            outputs: outputs.clone(),
            meta: meta.clone(),
        }),
        EngineEvent::JobFailed {
            job_id,
            kind,
            error,
        } => Some(ServerMessage::JobError {
            job_id: Some(job_id.clone()),
            id: None,
            error: error.clone(),
            kind: kind.as_str().to_string(),
        }),
        EngineEvent::JobCanceled { job_id } => Some(ServerMessage::JobCancel {
            job_id: job_id.clone(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
