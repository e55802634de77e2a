//! Error taxonomy shared across the service.
//!
//! Every failure that can reach a client carries a stable [`ErrorKind`]
//! plus a human-readable message. The kind is what clients key retry
//! policy on; the message is for humans and logs.

use serde::Serialize;

/// Stable machine-readable error kinds emitted on `job:error` envelopes
/// and admin responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Malformed envelope or missing/invalid params. Non-retriable.
    BadRequest,
    /// An `init_image_ref` expired or was never uploaded. Re-upload and
    /// resubmit.
    RefNotFound,
    /// Submit rejected because the queue is at capacity. Retriable with
    /// backoff.
    QueueFull,
    /// Only one dream session is allowed at a time.
    DreamBusy,
    /// The requested mode does not exist in the configuration.
    ModeNotFound,
    /// The worker for a mode could not be constructed; the previous mode
    /// stays loaded.
    ModelLoadFailed,
    /// Generation raised an internal error. Retriable.
    WorkerFailure,
    /// Client-initiated or disconnect-induced cancellation. Terminal.
    Canceled,
    /// The process is shutting down. Terminal.
    Shutdown,
    /// The per-job watchdog fired. Terminal.
    Timeout,
}

impl ErrorKind {
    /// Wire representation used in JSON envelopes.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::RefNotFound => "RefNotFound",
            ErrorKind::QueueFull => "QueueFull",
            ErrorKind::DreamBusy => "DreamBusy",
            ErrorKind::ModeNotFound => "ModeNotFound",
            ErrorKind::ModelLoadFailed => "ModelLoadFailed",
            ErrorKind::WorkerFailure => "WorkerFailure",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::Shutdown => "Shutdown",
            ErrorKind::Timeout => "Timeout",
        }
    }

    /// Terminal kinds close out a job; the rest are request-level
    /// rejections that never created or mutated a job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::WorkerFailure
                | ErrorKind::Canceled
                | ErrorKind::Shutdown
                | ErrorKind::Timeout
                | ErrorKind::ModelLoadFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error: a kind plus a message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn ref_not_found(reference: &str) -> Self {
        Self::new(
            ErrorKind::RefNotFound,
            format!("fileRef '{reference}' not found or expired"),
        )
    }

    pub fn mode_not_found(mode: &str, available: &[String]) -> Self {
        Self::new(
            ErrorKind::ModeNotFound,
            format!("Mode '{mode}' not found. Available modes: {available:?}"),
        )
    }

    /// Worker failures surface with a truncated message so a deep stack
    /// of device errors does not balloon the wire frame.
    pub fn worker_failure(message: impl Into<String>) -> Self {
        let mut message = message.into();
        const MAX: usize = 500;
        if message.len() > MAX {
            message.truncate(MAX);
            message.push_str("...");
        }
        Self::new(ErrorKind::WorkerFailure, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_as_str() {
        assert_eq!(ErrorKind::QueueFull.as_str(), "QueueFull");
        assert_eq!(ErrorKind::RefNotFound.to_string(), "RefNotFound");
    }

    #[test]
    fn terminal_classification() {
        assert!(ErrorKind::Canceled.is_terminal());
        assert!(ErrorKind::Timeout.is_terminal());
        assert!(!ErrorKind::BadRequest.is_terminal());
        assert!(!ErrorKind::QueueFull.is_terminal());
    }

    #[test]
    fn worker_failure_truncates_long_messages() {
        let err = CoreError::worker_failure("x".repeat(2000));
        assert!(err.message.len() <= 503);
        assert!(err.message.ends_with("..."));
    }
}
