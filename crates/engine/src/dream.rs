//! The dream controller: a long-running exploration loop that submits
//! mutated generation jobs at background priority until stopped or its
//! configured duration elapses.
//!
//! One dream session per process. The owning WS session steers it live
//! (`dream:guide`) and stopping -- explicit, duration-elapsed, or
//! owner-disconnect -- cancels queued children, lets the running child
//! finish, and emits final statistics.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use darkroom_core::dream::{next_tick_params, DreamGuidance, DreamPhase};
use darkroom_core::error::{CoreError, ErrorKind};
use darkroom_core::job::{GenerateParams, Job, JobId, JobPayload, JobSource, Priority};
use darkroom_events::{DreamStats, EngineEvent, EventBus, OutputRef};

use crate::pool::WorkerPool;

/// Most recent candidates retained for `dream:top`.
const CANDIDATE_BUFFER: usize = 100;

/// How long `stop` waits for the running child before giving up. The
/// pool's own watchdog bounds child runtime, so this is a backstop.
const STOP_DRAIN_LIMIT: Duration = Duration::from_secs(60);

/// Validated `dream:start` parameters.
#[derive(Debug, Clone)]
pub struct DreamStartParams {
    pub prompt: String,
    pub duration_hours: f64,
    pub temperature: f64,
    pub interval_ms: u64,
}

impl DreamStartParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::bad_request("prompt must not be empty"));
        }
        if !(self.duration_hours > 0.0 && self.duration_hours <= 24.0) {
            return Err(CoreError::bad_request(
                "durationHours must be in (0, 24]",
            ));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(CoreError::bad_request("temperature must be in [0, 1]"));
        }
        if self.interval_ms < 10 {
            return Err(CoreError::bad_request("intervalMs must be >= 10"));
        }
        Ok(())
    }
}

/// Point-in-time view of the dream session for `dream:status`.
#[derive(Debug, Clone, Serialize)]
pub struct DreamStatus {
    pub active: bool,
    pub phase: String,
    pub base_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub interval_ms: Option<u64>,
    pub ticks: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub elapsed_seconds: f64,
}

/// A completed child job surfaced through `dream:top`.
#[derive(Debug, Clone, Serialize)]
pub struct DreamCandidate {
    pub job_id: JobId,
    pub prompt: String,
    pub seed: u64,
    pub outputs: Vec<OutputRef>,
}

struct DreamSession {
    session_id: String,
    owner_session: Option<String>,
    phase: DreamPhase,
    guidance: DreamGuidance,
    template: GenerateParams,
    interval: Duration,
    deadline: Instant,
    started_at: Instant,
    cancel: CancellationToken,
    ticks: u64,
    completed: u64,
    failed: u64,
    canceled: u64,
    /// Children not yet terminal. Queued ones get canceled on stop.
    live_children: HashSet<JobId>,
    candidates: VecDeque<DreamCandidate>,
}

impl DreamSession {
    fn stats(&self) -> DreamStats {
        DreamStats {
            total: self.ticks,
            completed: self.completed,
            failed: self.failed,
            canceled: self.canceled,
            elapsed_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

/// Process-wide dream controller. One instance, owned by app state.
pub struct DreamController {
    pool: Arc<WorkerPool>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<Option<DreamSession>>>,
    drained: Arc<Notify>,
}

impl DreamController {
    pub fn new(pool: Arc<WorkerPool>, bus: Arc<EventBus>) -> Self {
        Self {
            pool,
            bus,
            state: Arc::new(Mutex::new(None)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .expect("dream lock poisoned")
            .as_ref()
            .is_some_and(|s| s.phase != DreamPhase::Idle)
    }

    /// Begin a dream session. `template` supplies the non-mutated
    /// generation parameters (size, steps, guidance from the current
    /// mode's defaults); `owner_session` ties the dream to a WS session
    /// for disconnect cleanup.
    pub fn start(
        &self,
        params: DreamStartParams,
        template: GenerateParams,
        owner_session: Option<String>,
    ) -> Result<String, CoreError> {
        params.validate()?;

        let mut state = self.state.lock().expect("dream lock poisoned");
        if state.is_some() {
            return Err(CoreError::new(
                ErrorKind::DreamBusy,
                "a dream session is already active",
            ));
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(params.interval_ms);
        let deadline = Instant::now() + Duration::from_secs_f64(params.duration_hours * 3600.0);

        *state = Some(DreamSession {
            session_id: session_id.clone(),
            owner_session,
            phase: DreamPhase::Dreaming,
            guidance: DreamGuidance {
                base_prompt: params.prompt,
                temperature: params.temperature,
            },
            template,
            interval,
            deadline,
            started_at: Instant::now(),
            cancel: cancel.clone(),
            ticks: 0,
            completed: 0,
            failed: 0,
            canceled: 0,
            live_children: HashSet::new(),
            candidates: VecDeque::new(),
        });
        drop(state);

        tracing::info!(session_id = %session_id, "Dream session started");
        self.bus.publish(EngineEvent::DreamStarted {
            session_id: session_id.clone(),
        });

        tokio::spawn(tick_loop(
            Arc::clone(&self.pool),
            Arc::clone(&self.bus),
            Arc::clone(&self.state),
            Arc::clone(&self.drained),
            cancel,
            interval,
        ));

        Ok(session_id)
    }

    /// Replace the base prompt and/or temperature. Applies from the next
    /// tick; in-flight children are not touched.
    pub fn guide(
        &self,
        prompt: Option<String>,
        temperature: Option<f64>,
    ) -> Result<(String, f64), CoreError> {
        if let Some(t) = temperature {
            if !(0.0..=1.0).contains(&t) {
                return Err(CoreError::bad_request("temperature must be in [0, 1]"));
            }
        }
        let mut state = self.state.lock().expect("dream lock poisoned");
        let session = state
            .as_mut()
            .ok_or_else(|| CoreError::bad_request("no active dream session"))?;
        if let Some(prompt) = prompt {
            session.guidance.base_prompt = prompt;
        }
        if let Some(t) = temperature {
            session.guidance.temperature = t;
        }
        tracing::info!(
            prompt = %session.guidance.base_prompt,
            temperature = session.guidance.temperature,
            "Dream guidance updated"
        );
        Ok((
            session.guidance.base_prompt.clone(),
            session.guidance.temperature,
        ))
    }

    pub fn status(&self) -> DreamStatus {
        let state = self.state.lock().expect("dream lock poisoned");
        match state.as_ref() {
            Some(s) => DreamStatus {
                active: s.phase == DreamPhase::Dreaming,
                phase: format!("{:?}", s.phase).to_lowercase(),
                base_prompt: Some(s.guidance.base_prompt.clone()),
                temperature: Some(s.guidance.temperature),
                interval_ms: Some(s.interval.as_millis() as u64),
                ticks: s.ticks,
                completed: s.completed,
                failed: s.failed,
                canceled: s.canceled,
                elapsed_seconds: s.started_at.elapsed().as_secs_f64(),
            },
            None => DreamStatus {
                active: false,
                phase: "idle".to_string(),
                base_prompt: None,
                temperature: None,
                interval_ms: None,
                ticks: 0,
                completed: 0,
                failed: 0,
                canceled: 0,
                elapsed_seconds: 0.0,
            },
        }
    }

    /// Most recent completed candidates, newest first.
    pub fn top(&self, limit: usize) -> Vec<DreamCandidate> {
        let state = self.state.lock().expect("dream lock poisoned");
        state
            .as_ref()
            .map(|s| s.candidates.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Stop the session: cancel queued children, wait for the running
    /// child, then report stats. Errors when no session is active.
    pub async fn stop(&self) -> Result<DreamStats, CoreError> {
        let (cancel, queued_children) = {
            let mut state = self.state.lock().expect("dream lock poisoned");
            let session = state
                .as_mut()
                .ok_or_else(|| CoreError::bad_request("no active dream session"))?;
            if session.phase == DreamPhase::Stopping {
                return Err(CoreError::bad_request("dream session is already stopping"));
            }
            session.phase = DreamPhase::Stopping;
            (
                session.cancel.clone(),
                session.live_children.iter().cloned().collect::<Vec<_>>(),
            )
        };

        cancel.cancel();
        // Queued children terminate now; the running one finishes.
        for child in &queued_children {
            self.pool.cancel_if_queued(child);
        }

        let deadline = Instant::now() + STOP_DRAIN_LIMIT;
        loop {
            let remaining = {
                let state = self.state.lock().expect("dream lock poisoned");
                state.as_ref().map(|s| s.live_children.len()).unwrap_or(0)
            };
            if remaining == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.drained.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        let stats = {
            let mut state = self.state.lock().expect("dream lock poisoned");
            let session = state.take();
            session.map(|s| s.stats()).unwrap_or_default()
        };

        tracing::info!(
            total = stats.total,
            completed = stats.completed,
            "Dream session stopped"
        );
        self.bus.publish(EngineEvent::DreamStopped {
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Disconnect hook: stop the dream iff `session_id` owns it.
    pub async fn stop_if_owner(&self, session_id: &str) {
        let owns = {
            let state = self.state.lock().expect("dream lock poisoned");
            state
                .as_ref()
                .is_some_and(|s| s.owner_session.as_deref() == Some(session_id))
        };
        if owns {
            tracing::info!(session_id, "Owner disconnected, stopping dream");
            let _ = self.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

async fn tick_loop(
    pool: Arc<WorkerPool>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<Option<DreamSession>>>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        // Decide under the lock whether this tick runs, and build the
        // mutated params while we hold the guidance.
        let tick = {
            let mut guard = state.lock().expect("dream lock poisoned");
            let Some(session) = guard.as_mut() else { return };
            if Instant::now() >= session.deadline {
                // Duration elapsed: leave the lock, then self-stop below.
                None
            } else if !session.phase.accepts_ticks() {
                continue;
            } else {
                let mut rng = rand::rng();
                let params = next_tick_params(&session.template, &session.guidance, &mut rng);
                Some(params)
            }
        };

        let Some(params) = tick else {
            // Auto-stop at the deadline. The controller is rebuilt from
            // its parts because the loop does not hold one.
            let controller = DreamController {
                pool: Arc::clone(&pool),
                bus: Arc::clone(&bus),
                state: Arc::clone(&state),
                drained: Arc::clone(&drained),
            };
            let _ = controller.stop().await;
            return;
        };

        let prompt = params.prompt.clone();
        let seed = params.seed;
        let job = Job::new(
            JobPayload::DreamTick(params),
            Priority::Background,
            JobSource::Dream,
        );
        let job_id = job.id.clone();

        match pool.submit(job) {
            Ok(ticket) => {
                {
                    let mut guard = state.lock().expect("dream lock poisoned");
                    if let Some(session) = guard.as_mut() {
                        session.ticks += 1;
                        session.live_children.insert(job_id.clone());
                    }
                }
                tracing::debug!(job_id = %job_id, prompt = %prompt, "Dream tick submitted");
                tokio::spawn(watch_child(
                    Arc::clone(&bus),
                    Arc::clone(&state),
                    Arc::clone(&drained),
                    ticket,
                    prompt,
                    seed,
                ));
            }
            Err(err) if err.kind == ErrorKind::QueueFull => {
                // Backpressure: skip this tick rather than pile up.
                tracing::debug!("Dream tick skipped, queue full");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Dream tick submit failed");
            }
        }
    }
}

async fn watch_child(
    bus: Arc<EventBus>,
    state: Arc<Mutex<Option<DreamSession>>>,
    drained: Arc<Notify>,
    ticket: crate::pool::JobTicket,
    prompt: String,
    seed: u64,
) {
    let job_id = ticket.job_id.clone();
    let outcome = ticket.wait().await;

    let candidate = match &outcome {
        Ok(success) => Some(DreamCandidate {
            job_id: job_id.clone(),
            prompt: prompt.clone(),
            seed,
            outputs: success.outputs.clone(),
        }),
        Err(_) => None,
    };

    let now_empty = {
        let mut guard = state.lock().expect("dream lock poisoned");
        let Some(session) = guard.as_mut() else { return };
        session.live_children.remove(&job_id);
        match &outcome {
            Ok(_) => session.completed += 1,
            Err(err) if err.kind == ErrorKind::Canceled => session.canceled += 1,
            Err(_) => session.failed += 1,
        }
        if let Some(candidate) = &candidate {
            if session.candidates.len() == CANDIDATE_BUFFER {
                session.candidates.pop_front();
            }
            session.candidates.push_back(candidate.clone());
        }
        session.live_children.is_empty()
    };

    if let Some(candidate) = candidate {
        bus.publish(EngineEvent::DreamCandidate {
            job_id: candidate.job_id,
            prompt: candidate.prompt,
            seed: candidate.seed,
            outputs: candidate.outputs,
        });
    }
    if now_empty {
        drained.notify_waiters();
    }
}
