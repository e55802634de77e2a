//! Content-addressed store for generation outputs.
//!
//! Keys are derived from the canonical job inputs, so resubmitting the
//! same request overwrites the entry with identical content. Blobs are
//! immutable once keyed and are served by the HTTP bridge at
//! `/storage/{key}`.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One stored output.
#[derive(Debug, Clone)]
pub struct OutputBlob {
    pub key: String,
    pub bytes: Bytes,
    pub mime: String,
    pub created_at: DateTime<Utc>,
}

/// Storage health summary for `system:status` payloads.
#[derive(Debug, Clone, Serialize)]
pub struct BlobHealth {
    pub ok: bool,
    pub count: usize,
    pub total_bytes: usize,
}

/// In-memory blob store. Written by the worker pool's execution thread,
/// read by HTTP handlers.
#[derive(Default)]
pub struct BlobStore {
    blobs: RwLock<HashMap<String, OutputBlob>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under a content key. Re-putting an existing key is
    /// harmless: identical inputs produce identical content.
    pub fn put(&self, key: &str, bytes: Vec<u8>, mime: &str) {
        let blob = OutputBlob {
            key: key.to_string(),
            bytes: Bytes::from(bytes),
            mime: mime.to_string(),
            created_at: Utc::now(),
        };
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .insert(key.to_string(), blob);
    }

    pub fn get(&self, key: &str) -> Option<OutputBlob> {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .contains_key(key)
    }

    pub fn health(&self) -> BlobHealth {
        let blobs = self.blobs.read().expect("blob lock poisoned");
        BlobHealth {
            ok: true,
            count: blobs.len(),
            total_bytes: blobs.values().map(|b| b.bytes.len()).sum(),
        }
    }
}
