//! The [`EngineEvent`] type and the broadcast bus that carries it.

use serde::Serialize;
use tokio::sync::broadcast;

use darkroom_core::error::ErrorKind;
use darkroom_core::job::{JobDescriptor, JobId};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Reference to a stored output blob.
#[derive(Debug, Clone, Serialize)]
pub struct OutputRef {
    pub key: String,
    pub url: String,
}

/// Metadata attached to a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobMeta {
    pub seed: Option<u64>,
    pub backend: String,
    pub sr: bool,
}

/// Aggregate statistics for a finished dream session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DreamStats {
    /// Ticks that produced a submitted child job.
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub elapsed_seconds: f64,
}

/// Everything the engine tells the rest of the process.
///
/// Job events for a given `job_id` are published in lifecycle order:
/// queued, started, progress*, then exactly one terminal
/// (completed / failed / canceled). Events across different jobs carry
/// no ordering guarantee.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    JobQueued {
        descriptor: JobDescriptor,
    },
    JobStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        /// Completion fraction in `[0, 1]`.
        fraction: f64,
        status: String,
    },
    JobCompleted {
        job_id: JobId,
        outputs: Vec<OutputRef>,
        meta: JobMeta,
    },
    JobFailed {
        job_id: JobId,
        kind: ErrorKind,
        error: String,
    },
    JobCanceled {
        job_id: JobId,
    },
    /// Published after every queue mutation, with an atomic snapshot.
    QueueChanged {
        pending: usize,
        running: usize,
        jobs: Vec<JobDescriptor>,
    },
    /// The pool finished a mode switch (or unloaded entirely).
    ModeChanged {
        mode: Option<String>,
    },
    DreamStarted {
        session_id: String,
    },
    /// A dream child job finished; candidates are surfaced as-is, scoring
    /// is a collaborator concern.
    DreamCandidate {
        job_id: JobId,
        prompt: String,
        seed: u64,
        outputs: Vec<OutputRef>,
    },
    DreamStopped {
        stats: DreamStats,
    },
}

impl EngineEvent {
    /// The job this event belongs to, when it is job-scoped.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            EngineEvent::JobQueued { descriptor } => Some(&descriptor.id),
            EngineEvent::JobStarted { job_id }
            | EngineEvent::JobProgress { job_id, .. }
            | EngineEvent::JobCompleted { job_id, .. }
            | EngineEvent::JobFailed { job_id, .. }
            | EngineEvent::JobCanceled { job_id } => Some(job_id),
            _ => None,
        }
    }

    /// Whether this event closes out its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::JobCompleted { .. }
                | EngineEvent::JobFailed { .. }
                | EngineEvent::JobCanceled { .. }
        )
    }
}

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so any number of subscribers can
/// independently receive every published [`EngineEvent`]. Publishing is
/// synchronous and thread-safe, which is what lets the worker pool's
/// blocking thread hand events to the async side without blocking on it.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are
    /// dropped and slow receivers observe `RecvError::Lagged` -- which is
    /// exactly the coalescing behavior wanted for progress streams.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// With zero subscribers the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::JobStarted {
            job_id: "abc123def456".to_string(),
        });

        let received = rx.recv().await.expect("should receive the event");
        match received {
            EngineEvent::JobStarted { job_id } => assert_eq!(job_id, "abc123def456"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineEvent::ModeChanged {
            mode: Some("sdxl-base".to_string()),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.expect("should receive") {
                EngineEvent::ModeChanged { mode } => {
                    assert_eq!(mode.as_deref(), Some("sdxl-base"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::JobCanceled {
            job_id: "orphan".to_string(),
        });
    }

    #[test]
    fn job_id_extraction() {
        let event = EngineEvent::JobProgress {
            job_id: "j1".to_string(),
            fraction: 0.5,
            status: "running".to_string(),
        };
        assert_eq!(event.job_id().map(String::as_str), Some("j1"));
        assert!(!event.is_terminal());

        let event = EngineEvent::QueueChanged {
            pending: 0,
            running: 0,
            jobs: vec![],
        };
        assert!(event.job_id().is_none());
    }

    #[test]
    fn terminal_classification() {
        assert!(EngineEvent::JobCompleted {
            job_id: "j".into(),
            outputs: vec![],
            meta: JobMeta {
                seed: Some(1),
                backend: "test".into(),
                sr: false
            },
        }
        .is_terminal());
        assert!(!EngineEvent::JobStarted { job_id: "j".into() }.is_terminal());
    }
}
