//! The worker pool: a single dedicated execution thread that serializes
//! queued jobs against the loaded worker.
//!
//! Producers (session router, dream controller, HTTP adapters) submit
//! from any task and get back a [`JobTicket`] resolving to the terminal
//! outcome. Lifecycle events flow out over the [`EventBus`] so fan-out
//! never blocks the execution thread.
//!
//! Mode switches travel through the same queue as ordinary jobs, at
//! urgent priority, so they serialize naturally against in-flight work.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use darkroom_core::error::{CoreError, ErrorKind};
use darkroom_core::hashing::sha256_hex;
use darkroom_core::job::{Job, JobDescriptor, JobPayload, JobState, Priority};
use darkroom_core::mode::ModeProvider;
use darkroom_core::registry::{ModelInfo, ModelRegistry};
use darkroom_events::{EngineEvent, EventBus, JobMeta, OutputRef};

use crate::blob::BlobStore;
use crate::queue::{PriorityQueue, QueuedJob};
use crate::worker::{JobOutcome, JobSuccess, ProgressUpdate, Worker, WorkerError, WorkerFactory};

/// The pool owns exactly one accelerator-bound worker. The id survives
/// mode switches; only the loaded resources are recreated.
const WORKER_ID: u32 = 0;

/// Tunables for pool construction.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum queued jobs before `submit` rejects with `QueueFull`.
    pub queue_max: usize,
    /// Per-job watchdog: the cancel token fires after this long.
    pub job_timeout: Duration,
    /// Mode to load before the first job. `None` starts with no worker;
    /// generation then fails until a mode switch succeeds.
    pub initial_mode: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            queue_max: 64,
            job_timeout: Duration::from_secs(600),
            initial_mode: None,
        }
    }
}

/// Handle to a submitted job: its server-assigned id plus a future for
/// the terminal outcome.
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    /// Await the terminal outcome. A dropped pool resolves as `Shutdown`.
    pub async fn wait(self) -> JobOutcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(CoreError::new(
                ErrorKind::Shutdown,
                "pool stopped before the job completed",
            ))
        })
    }

    fn resolved(job_id: String, outcome: JobOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { job_id, rx }
    }
}

/// Bookkeeping for the job currently on the accelerator.
struct RunningJob {
    descriptor: JobDescriptor,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

struct PoolShared {
    queue: PriorityQueue,
    bus: Arc<EventBus>,
    registry: Arc<ModelRegistry>,
    modes: Arc<dyn ModeProvider>,
    factory: Arc<dyn WorkerFactory>,
    blobs: Arc<BlobStore>,
    running: Mutex<Option<RunningJob>>,
    current_mode: Mutex<Option<String>>,
    stopping: AtomicBool,
    job_timeout: Duration,
    /// Handle onto the async runtime, used to host per-job watchdogs.
    rt: tokio::runtime::Handle,
}

impl PoolShared {
    fn publish_queue_changed(&self) {
        let jobs = self.queue.snapshot();
        let running = usize::from(self.running.lock().expect("running lock poisoned").is_some());
        self.bus.publish(EngineEvent::QueueChanged {
            pending: jobs.len(),
            running,
            jobs,
        });
    }
}

/// The pool itself. Wrap in `Arc` and clone freely; `shutdown` is
/// idempotent and joins the execution thread.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Construct the pool, load the initial mode (if any), and start the
    /// execution thread.
    ///
    /// Must be called from within a tokio runtime; the handle is captured
    /// for watchdog tasks. A failing initial load is a startup error --
    /// the caller decides whether that is fatal.
    pub fn start(
        options: PoolOptions,
        factory: Arc<dyn WorkerFactory>,
        modes: Arc<dyn ModeProvider>,
        registry: Arc<ModelRegistry>,
        blobs: Arc<BlobStore>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, CoreError> {
        let shared = Arc::new(PoolShared {
            queue: PriorityQueue::new(options.queue_max),
            bus,
            registry,
            modes,
            factory,
            blobs,
            running: Mutex::new(None),
            current_mode: Mutex::new(None),
            stopping: AtomicBool::new(false),
            job_timeout: options.job_timeout,
            rt: tokio::runtime::Handle::current(),
        });

        // Initial load happens on the caller's thread so a broken worker
        // factory surfaces as a startup error, not a dead queue.
        let mut worker: Option<Box<dyn Worker>> = None;
        if let Some(mode) = &options.initial_mode {
            switch_worker(&shared, &mut worker, mode)?;
        }

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("darkroom-pool".to_string())
            .spawn(move || run_loop(loop_shared, worker))
            .map_err(|e| {
                CoreError::new(
                    ErrorKind::WorkerFailure,
                    format!("failed to spawn pool thread: {e}"),
                )
            })?;

        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Enqueue a job. Non-blocking; rejects with `QueueFull` past the
    /// backlog limit and `Shutdown` once stopping.
    pub fn submit(&self, job: Job) -> Result<JobTicket, CoreError> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(CoreError::new(ErrorKind::Shutdown, "pool is shutting down"));
        }
        let job_id = job.id.clone();
        let descriptor = JobDescriptor::from(&job);
        let (tx, rx) = oneshot::channel();
        let queued = QueuedJob {
            job,
            done: tx,
            cancel: CancellationToken::new(),
        };
        self.shared.queue.put(queued).map_err(|(err, _)| err)?;
        tracing::debug!(job_id = %job_id, "Job queued");
        self.shared
            .bus
            .publish(EngineEvent::JobQueued { descriptor });
        self.shared.publish_queue_changed();
        Ok(JobTicket { job_id, rx })
    }

    /// Cancel a job by id. Queued jobs terminate immediately; the running
    /// job has its token set and stops at the worker's next poll point.
    /// Returns `false` for unknown or already-terminal ids.
    pub fn cancel(&self, job_id: &str) -> bool {
        if self.cancel_if_queued(job_id) {
            return true;
        }
        let running = self.shared.running.lock().expect("running lock poisoned");
        match running.as_ref() {
            Some(current) if current.descriptor.id == job_id => {
                tracing::info!(job_id, "Cancel requested for running job");
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel only if still queued; a running job is left untouched.
    /// Used by the dream controller, which lets the running child finish.
    pub fn cancel_if_queued(&self, job_id: &str) -> bool {
        let Some(queued) = self.shared.queue.remove(job_id) else {
            return false;
        };
        queued.cancel.cancel();
        tracing::info!(job_id, "Canceled queued job");
        self.shared.bus.publish(EngineEvent::JobCanceled {
            job_id: job_id.to_string(),
        });
        let _ = queued.done.send(Err(CoreError::new(
            ErrorKind::Canceled,
            "canceled while queued",
        )));
        self.shared.publish_queue_changed();
        true
    }

    /// Change a queued job's priority. No-op (returns `false`) for
    /// running, terminal, or unknown jobs.
    pub fn reprioritize(&self, job_id: &str, priority: Priority) -> bool {
        let changed = self.shared.queue.update_priority(job_id, priority);
        if changed {
            tracing::debug!(job_id, ?priority, "Job reprioritized");
            self.shared.publish_queue_changed();
        }
        changed
    }

    /// Queue a switch to `mode` at urgent priority.
    ///
    /// Switching to the mode that is already loaded resolves immediately
    /// without occupying the queue or touching the worker.
    pub fn switch_mode(&self, mode: &str) -> Result<JobTicket, CoreError> {
        // Validate up front so unknown modes never occupy the queue.
        self.shared.modes.get(mode)?;

        let payload = JobPayload::ModeSwitch {
            mode: mode.to_string(),
        };
        if self.current_mode().as_deref() == Some(mode) {
            let job = Job::new(payload, Priority::Urgent, darkroom_core::job::JobSource::Http);
            let meta = JobMeta {
                seed: None,
                backend: "pool".to_string(),
                sr: false,
            };
            self.shared.bus.publish(EngineEvent::JobCompleted {
                job_id: job.id.clone(),
                outputs: vec![],
                meta: meta.clone(),
            });
            return Ok(JobTicket::resolved(
                job.id,
                Ok(JobSuccess {
                    outputs: vec![],
                    meta,
                }),
            ));
        }

        self.submit(Job::new(
            payload,
            Priority::Urgent,
            darkroom_core::job::JobSource::Http,
        ))
    }

    pub fn current_mode(&self) -> Option<String> {
        self.shared
            .current_mode
            .lock()
            .expect("mode lock poisoned")
            .clone()
    }

    /// Atomic view of the queue plus whatever is on the accelerator.
    pub fn queue_state(&self) -> (Vec<JobDescriptor>, Option<JobDescriptor>) {
        // Take the running snapshot first: a job observed both here and
        // in the queue would be worse than one observed in neither.
        let running = self
            .shared
            .running
            .lock()
            .expect("running lock poisoned")
            .as_ref()
            .map(|r| r.descriptor.clone());
        (self.shared.queue.snapshot(), running)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn running_count(&self) -> usize {
        usize::from(self.shared.running.lock().expect("running lock poisoned").is_some())
    }

    /// Async wrapper around [`shutdown`](Self::shutdown) that parks the
    /// blocking join on the blocking executor.
    pub async fn shutdown_async(self: Arc<Self>) {
        let _ = tokio::task::spawn_blocking(move || self.shutdown()).await;
    }

    /// Stop the pool: the in-flight job completes naturally, every queued
    /// job fails with `Shutdown`, the worker unloads, and the execution
    /// thread is joined. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            tracing::info!("Worker pool shutting down");
            self.shared.queue.close();
        }
        if let Some(handle) = self.thread.lock().expect("thread lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Execution thread
// ---------------------------------------------------------------------------

fn run_loop(shared: Arc<PoolShared>, mut worker: Option<Box<dyn Worker>>) {
    tracing::info!("Worker pool execution thread started");

    while let Some(queued) = shared.queue.pop_blocking() {
        // A cancel can race the dequeue; honor it before starting.
        if queued.cancel.is_cancelled() {
            let job_id = queued.job.id.clone();
            shared
                .bus
                .publish(EngineEvent::JobCanceled { job_id: job_id.clone() });
            let _ = queued.done.send(Err(CoreError::new(
                ErrorKind::Canceled,
                "canceled before start",
            )));
            shared.publish_queue_changed();
            continue;
        }

        let switch_target = match &queued.job.payload {
            JobPayload::ModeSwitch { mode } => Some(mode.clone()),
            _ => None,
        };
        match switch_target {
            Some(target) => handle_mode_switch(&shared, &mut worker, queued, &target),
            None => run_job(&shared, &mut worker, queued),
        }
    }

    // Queue closed: fail everything still pending with Shutdown.
    for queued in shared.queue.drain() {
        let job_id = queued.job.id.clone();
        let err = CoreError::new(ErrorKind::Shutdown, "server shutting down");
        shared.bus.publish(EngineEvent::JobFailed {
            job_id,
            kind: ErrorKind::Shutdown,
            error: err.message.clone(),
        });
        let _ = queued.done.send(Err(err));
    }

    if let Some(mut old) = worker.take() {
        old.unload();
        if let Some(mode) = shared
            .current_mode
            .lock()
            .expect("mode lock poisoned")
            .take()
        {
            shared.registry.unregister(&mode);
        }
        shared.bus.publish(EngineEvent::ModeChanged { mode: None });
    }

    tracing::info!("Worker pool execution thread stopped");
}

fn handle_mode_switch(
    shared: &PoolShared,
    slot: &mut Option<Box<dyn Worker>>,
    queued: QueuedJob,
    target: &str,
) {
    let job_id = queued.job.id.clone();
    let current = shared
        .current_mode
        .lock()
        .expect("mode lock poisoned")
        .clone();

    let result = if current.as_deref() == Some(target) {
        tracing::debug!(mode = target, "Mode switch target already loaded");
        Ok(())
    } else {
        switch_worker(shared, slot, target)
    };

    match result {
        Ok(()) => {
            let meta = JobMeta {
                seed: None,
                backend: "pool".to_string(),
                sr: false,
            };
            shared.bus.publish(EngineEvent::JobCompleted {
                job_id,
                outputs: vec![],
                meta: meta.clone(),
            });
            let _ = queued.done.send(Ok(JobSuccess {
                outputs: vec![],
                meta,
            }));
        }
        Err(err) => {
            tracing::error!(mode = target, error = %err, "Mode switch failed");
            shared.bus.publish(EngineEvent::JobFailed {
                job_id,
                kind: err.kind,
                error: err.message.clone(),
            });
            let _ = queued.done.send(Err(err));
        }
    }
    shared.publish_queue_changed();
}

/// Unload the current worker (if any) and build one for `target`.
///
/// On build failure the recorded mode is left unchanged; queued jobs
/// are untouched either way and resume against whatever is loaded.
fn switch_worker(
    shared: &PoolShared,
    slot: &mut Option<Box<dyn Worker>>,
    target: &str,
) -> Result<(), CoreError> {
    let spec = shared.modes.get(target)?;

    let estimated = ModelRegistry::estimate_model_vram(&spec.model_path);
    if estimated > 0 && !shared.registry.can_fit(estimated) {
        tracing::warn!(
            mode = target,
            estimated_mb = estimated / (1024 * 1024),
            "Estimated VRAM exceeds availability; attempting load anyway"
        );
    }

    if let Some(mut old) = slot.take() {
        tracing::info!(from = old.mode(), to = target, "Unloading worker for mode switch");
        old.unload();
        if let Some(old_mode) = shared
            .current_mode
            .lock()
            .expect("mode lock poisoned")
            .clone()
        {
            shared.registry.unregister(&old_mode);
        }
    }

    let built = shared.factory.build(WORKER_ID, &spec).map_err(|e| {
        CoreError::new(ErrorKind::ModelLoadFailed, e.to_string())
    })?;

    shared.registry.register(ModelInfo {
        name: spec.name.clone(),
        model_path: spec.model_path.display().to_string(),
        vram_bytes: estimated,
        worker_id: Some(WORKER_ID),
        loras: spec.loras.iter().map(|l| l.path.clone()).collect(),
    });
    *slot = Some(built);
    *shared.current_mode.lock().expect("mode lock poisoned") = Some(spec.name.clone());
    shared.bus.publish(EngineEvent::ModeChanged {
        mode: Some(spec.name.clone()),
    });
    tracing::info!(mode = %spec.name, "Mode switch complete");
    Ok(())
}

fn run_job(shared: &PoolShared, slot: &mut Option<Box<dyn Worker>>, queued: QueuedJob) {
    let QueuedJob { job, done, cancel } = queued;
    let mut descriptor = JobDescriptor::from(&job);
    debug_assert!(descriptor.state.can_transition(JobState::Running));
    descriptor.state = JobState::Running;
    let job_id = job.id.clone();
    let timed_out = Arc::new(AtomicBool::new(false));

    *shared.running.lock().expect("running lock poisoned") = Some(RunningJob {
        descriptor,
        cancel: cancel.clone(),
        timed_out: Arc::clone(&timed_out),
    });
    shared
        .bus
        .publish(EngineEvent::JobStarted { job_id: job_id.clone() });
    shared.publish_queue_changed();

    // Watchdog: fires the job's cancel token at the execution deadline.
    let watchdog = {
        let cancel = cancel.clone();
        let flag = Arc::clone(&timed_out);
        let timeout = shared.job_timeout;
        shared.rt.spawn(async move {
            tokio::time::sleep(timeout).await;
            flag.store(true, Ordering::SeqCst);
            cancel.cancel();
        })
    };

    let bus = Arc::clone(&shared.bus);
    let progress_job_id = job_id.clone();
    let mut progress = |update: ProgressUpdate| {
        bus.publish(EngineEvent::JobProgress {
            job_id: progress_job_id.clone(),
            fraction: update.fraction.clamp(0.0, 1.0),
            status: update.status,
        });
    };

    let result = match slot.as_mut() {
        Some(worker) => {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                worker.run(&job, &mut progress, &cancel)
            }))
            .unwrap_or_else(|_| Err(WorkerError::Failure("worker panicked".to_string())))
        }
        None => Err(WorkerError::NotLoaded),
    };

    watchdog.abort();
    *shared.running.lock().expect("running lock poisoned") = None;

    let outcome: JobOutcome = match result {
        Ok(output) => {
            let key = content_key(&job);
            shared.blobs.put(&key, output.bytes, &output.mime);
            let outputs = vec![OutputRef {
                url: format!("/storage/{key}"),
                key,
            }];
            let meta = JobMeta {
                seed: output.seed,
                backend: output.backend,
                sr: output.did_superres,
            };
            tracing::info!(job_id = %job_id, key = %outputs[0].key, "Job complete");
            shared.bus.publish(EngineEvent::JobCompleted {
                job_id: job_id.clone(),
                outputs: outputs.clone(),
                meta: meta.clone(),
            });
            Ok(JobSuccess { outputs, meta })
        }
        Err(WorkerError::Canceled) if timed_out.load(Ordering::SeqCst) => {
            let err = CoreError::new(
                ErrorKind::Timeout,
                format!("job exceeded {}s execution limit", shared.job_timeout.as_secs()),
            );
            tracing::warn!(job_id = %job_id, "Job timed out");
            shared.bus.publish(EngineEvent::JobFailed {
                job_id: job_id.clone(),
                kind: ErrorKind::Timeout,
                error: err.message.clone(),
            });
            Err(err)
        }
        Err(WorkerError::Canceled) => {
            tracing::info!(job_id = %job_id, "Job canceled");
            shared.bus.publish(EngineEvent::JobCanceled {
                job_id: job_id.clone(),
            });
            Err(CoreError::new(ErrorKind::Canceled, "canceled by client"))
        }
        Err(WorkerError::NotLoaded) => {
            let err = CoreError::worker_failure("No worker available - switch to a mode first");
            shared.bus.publish(EngineEvent::JobFailed {
                job_id: job_id.clone(),
                kind: err.kind,
                error: err.message.clone(),
            });
            Err(err)
        }
        Err(WorkerError::LoadFailed(msg)) => {
            let err = CoreError::new(ErrorKind::ModelLoadFailed, msg);
            shared.bus.publish(EngineEvent::JobFailed {
                job_id: job_id.clone(),
                kind: err.kind,
                error: err.message.clone(),
            });
            Err(err)
        }
        Err(WorkerError::Failure(msg)) => {
            let err = CoreError::worker_failure(msg);
            tracing::error!(job_id = %job_id, error = %err.message, "Job failed");
            shared.bus.publish(EngineEvent::JobFailed {
                job_id: job_id.clone(),
                kind: err.kind,
                error: err.message.clone(),
            });
            Err(err)
        }
    };

    let _ = done.send(outcome);
    shared.publish_queue_changed();
}

/// Content-addressed key for a job's output. Derived from the canonical
/// inputs so identical requests map to identical keys.
fn content_key(job: &Job) -> String {
    match &job.payload {
        JobPayload::Generate(p) | JobPayload::DreamTick(p) => p.fingerprint(),
        JobPayload::Sr(p) => p.fingerprint(job.init_image.as_deref().unwrap_or_default()),
        JobPayload::Comfy(p) => p.fingerprint(job.init_image.as_deref()),
        // Mode switches never reach run_job; key on the id as a backstop.
        JobPayload::ModeSwitch { .. } => sha256_hex(job.id.as_bytes()),
    }
}
