//! Single-consumer, multi-producer job queue over four priority lanes.
//!
//! Ordering is `priority ASC, submitted_at ASC`: lanes are scanned
//! urgent-first and each lane is kept sorted by submission time (FIFO for
//! the normal submit path; reprioritized jobs are re-inserted by their
//! original submission time, not at the tail).
//!
//! All mutation happens under one mutex; the consumer blocks on a
//! condvar in [`PriorityQueue::pop_blocking`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use tokio_util::sync::CancellationToken;

use darkroom_core::error::{CoreError, ErrorKind};
use darkroom_core::job::{Job, JobDescriptor, Priority, LANE_COUNT};

use crate::worker::JobOutcome;

/// A job waiting in the queue, bundled with its completion channel and
/// cancel token.
pub struct QueuedJob {
    pub job: Job,
    pub done: tokio::sync::oneshot::Sender<JobOutcome>,
    pub cancel: CancellationToken,
}

impl QueuedJob {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor::from(&self.job)
    }
}

#[derive(Default)]
struct Lanes {
    lanes: [VecDeque<QueuedJob>; LANE_COUNT],
    closed: bool,
}

impl Lanes {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn position(&self, job_id: &str) -> Option<(usize, usize)> {
        self.lanes.iter().enumerate().find_map(|(lane, queue)| {
            queue
                .iter()
                .position(|qj| qj.job.id == job_id)
                .map(|idx| (lane, idx))
        })
    }

    /// Insert keeping the lane sorted by `submitted_at`.
    fn insert(&mut self, queued: QueuedJob) {
        let lane = &mut self.lanes[queued.job.priority.lane()];
        let at = lane.partition_point(|qj| qj.job.submitted_at <= queued.job.submitted_at);
        lane.insert(at, queued);
    }
}

/// The four-lane priority queue feeding the worker pool.
pub struct PriorityQueue {
    inner: Mutex<Lanes>,
    not_empty: Condvar,
    max: usize,
}

impl PriorityQueue {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(Lanes::default()),
            not_empty: Condvar::new(),
            max,
        }
    }

    /// Enqueue a job. Rejects with `QueueFull` when the backlog is at
    /// capacity and with `Shutdown` once the queue is closed; in both
    /// cases the queue is left untouched and the caller keeps the job.
    pub fn put(&self, queued: QueuedJob) -> Result<(), (CoreError, QueuedJob)> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.closed {
            return Err((
                CoreError::new(ErrorKind::Shutdown, "queue is closed"),
                queued,
            ));
        }
        if inner.len() >= self.max {
            return Err((
                CoreError::new(
                    ErrorKind::QueueFull,
                    format!("queue is full ({} jobs)", self.max),
                ),
                queued,
            ));
        }
        inner.insert(queued);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until a job is available or the queue is closed.
    ///
    /// Returns `None` on close; any jobs still queued at that point are
    /// recovered with [`drain`](Self::drain).
    pub fn pop_blocking(&self) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        loop {
            if inner.closed {
                return None;
            }
            for lane in inner.lanes.iter_mut() {
                if let Some(job) = lane.pop_front() {
                    return Some(job);
                }
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("queue lock poisoned");
        }
    }

    /// Remove a queued job by id, handing it back to the caller.
    pub fn remove(&self, job_id: &str) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let (lane, idx) = inner.position(job_id)?;
        inner.lanes[lane].remove(idx)
    }

    /// Move a queued job to a different lane. Returns `false` when the
    /// job is not queued (running or unknown).
    pub fn update_priority(&self, job_id: &str, priority: Priority) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some((lane, idx)) = inner.position(job_id) else {
            return false;
        };
        let Some(mut queued) = inner.lanes[lane].remove(idx) else {
            return false;
        };
        queued.job.priority = priority;
        inner.insert(queued);
        true
    }

    /// Atomic snapshot of everything queued, in pop order.
    pub fn snapshot(&self) -> Vec<JobDescriptor> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .lanes
            .iter()
            .flat_map(|lane| lane.iter().map(QueuedJob::descriptor))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: wakes the consumer and makes further `put`s fail
    /// with `Shutdown`.
    pub fn close(&self) {
        self.inner.lock().expect("queue lock poisoned").closed = true;
        self.not_empty.notify_all();
    }

    /// Take every remaining job out of the queue (used by shutdown to
    /// fail them with `Shutdown`).
    pub fn drain(&self) -> Vec<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .lanes
            .iter_mut()
            .flat_map(|lane| lane.drain(..))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
