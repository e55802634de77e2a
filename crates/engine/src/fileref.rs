//! Short-TTL keyed store bridging HTTP uploads into queued jobs.
//!
//! Uploads land here via `POST /v1/upload` and are consumed when a WS
//! submit references them. Refs are multi-read within the TTL (retries
//! after a failed submit must work); a background sweeper purges expired
//! entries on a 30 second cadence.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use darkroom_core::error::CoreError;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// How often the background sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    bytes: Vec<u8>,
    content_type: String,
    created_at: DateTime<Utc>,
}

/// Process-wide upload store. Create once at startup, share via `Arc`.
pub struct FileRefStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: chrono::Duration,
}

impl FileRefStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).expect("ttl fits in chrono range"),
        }
    }

    /// Store uploaded bytes, returning the opaque 128-bit ref key.
    pub fn put(&self, bytes: Vec<u8>, content_type: &str) -> String {
        let reference = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(reference = %reference, size = bytes.len(), "Upload stored");
        self.entries.lock().expect("fileref lock poisoned").insert(
            reference.clone(),
            Entry {
                bytes,
                content_type: content_type.to_string(),
                created_at: Utc::now(),
            },
        );
        reference
    }

    /// Resolve a ref to its bytes. Succeeds iff the entry exists and is
    /// within TTL; expired entries are removed on the spot.
    pub fn take(&self, reference: &str) -> Result<Vec<u8>, CoreError> {
        self.take_at(reference, Utc::now())
    }

    /// Clock-injected variant of [`take`](Self::take), used by tests to
    /// exercise expiry without sleeping.
    pub fn take_at(&self, reference: &str, now: DateTime<Utc>) -> Result<Vec<u8>, CoreError> {
        let mut entries = self.entries.lock().expect("fileref lock poisoned");
        match entries.get(reference) {
            Some(entry) if now - entry.created_at <= self.ttl => Ok(entry.bytes.clone()),
            Some(_) => {
                entries.remove(reference);
                Err(CoreError::ref_not_found(reference))
            }
            None => Err(CoreError::ref_not_found(reference)),
        }
    }

    /// Content type recorded at upload, if the ref is still live.
    pub fn content_type(&self, reference: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("fileref lock poisoned")
            .get(reference)
            .map(|e| e.content_type.clone())
    }

    /// Remove all entries older than TTL. Returns how many were purged.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().expect("fileref lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now - entry.created_at <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("fileref lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything. Called at shutdown.
    pub fn clear(&self) {
        self.entries.lock().expect("fileref lock poisoned").clear();
    }

    /// Spawn the background sweeper. Runs until the token is cancelled.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = store.purge_expired_at(Utc::now());
                        if purged > 0 {
                            tracing::debug!(purged, "Swept expired uploads");
                        }
                    }
                }
            }
        })
    }
}

impl Default for FileRefStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
