//! Model registry with VRAM accounting.
//!
//! Purely observational: tracks what is resident on the device and how
//! much memory it costs, but never loads or unloads anything itself.
//! Live usage comes from an injected [`DeviceMemoryProbe`]; the registry
//! only adds per-model estimates for forecasting (`can_fit`).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

/// Overhead factor applied to a model's file size when estimating its
/// VRAM footprint before loading.
const VRAM_ESTIMATE_OVERHEAD: f64 = 1.2;

/// Live device memory readings. Production supplies an accelerator-backed
/// probe; tests supply a fixed one.
pub trait DeviceMemoryProbe: Send + Sync {
    /// Currently allocated device memory in bytes.
    fn used_bytes(&self) -> u64;
    /// Total device memory in bytes (0 when no accelerator is present).
    fn total_bytes(&self) -> u64;
    /// Human-readable device name.
    fn device_name(&self) -> String;
}

/// A probe for hosts without an accelerator. All readings are zero, so
/// `can_fit` always answers `false` and the status payload reports the
/// absence honestly.
#[derive(Debug, Default)]
pub struct NullMemoryProbe;

impl DeviceMemoryProbe for NullMemoryProbe {
    fn used_bytes(&self) -> u64 {
        0
    }
    fn total_bytes(&self) -> u64 {
        0
    }
    fn device_name(&self) -> String {
        "no accelerator".to_string()
    }
}

/// Bookkeeping for one resident model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub model_path: String,
    pub vram_bytes: u64,
    pub worker_id: Option<u32>,
    pub loras: Vec<String>,
}

/// Aggregate VRAM statistics for status payloads.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub device: String,
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub usage_percent: f64,
    pub models_loaded: usize,
    pub models: Vec<ModelInfo>,
}

/// Thread-safe registry of resident models.
pub struct ModelRegistry {
    probe: Box<dyn DeviceMemoryProbe>,
    loaded: Mutex<BTreeMap<String, ModelInfo>>,
}

impl ModelRegistry {
    pub fn new(probe: Box<dyn DeviceMemoryProbe>) -> Self {
        tracing::info!(
            device = %probe.device_name(),
            total_mb = probe.total_bytes() / (1024 * 1024),
            "Model registry initialized"
        );
        Self {
            probe,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a model as resident.
    pub fn register(&self, info: ModelInfo) {
        tracing::info!(
            name = %info.name,
            vram_mb = info.vram_bytes / (1024 * 1024),
            "Model registered"
        );
        self.loaded
            .lock()
            .expect("registry lock poisoned")
            .insert(info.name.clone(), info);
    }

    /// Forget a model. Unknown names are a logged no-op.
    pub fn unregister(&self, name: &str) {
        let removed = self
            .loaded
            .lock()
            .expect("registry lock poisoned")
            .remove(name);
        match removed {
            Some(info) => tracing::info!(
                name,
                freed_mb = info.vram_bytes / (1024 * 1024),
                "Model unregistered"
            ),
            None => tracing::warn!(name, "Unregister of unknown model"),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded
            .lock()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Live allocated device memory, straight from the probe.
    pub fn used_bytes(&self) -> u64 {
        self.probe.used_bytes()
    }

    pub fn available_bytes(&self) -> u64 {
        self.probe.total_bytes().saturating_sub(self.probe.used_bytes())
    }

    /// Whether an estimated allocation would fit in free device memory.
    /// Hosts without an accelerator never fit anything.
    pub fn can_fit(&self, estimated_bytes: u64) -> bool {
        if self.probe.total_bytes() == 0 {
            return false;
        }
        estimated_bytes <= self.available_bytes()
    }

    /// Estimate a model's VRAM footprint from its file size plus a fixed
    /// inference overhead. Missing files estimate to zero.
    pub fn estimate_model_vram(path: &Path) -> u64 {
        match std::fs::metadata(path) {
            Ok(meta) => (meta.len() as f64 * VRAM_ESTIMATE_OVERHEAD) as u64,
            Err(_) => {
                tracing::warn!(path = %path.display(), "Model file not found for VRAM estimate");
                0
            }
        }
    }

    /// Snapshot for `system:status` and the `/api/vram` endpoint.
    pub fn stats(&self) -> RegistryStats {
        let used = self.probe.used_bytes();
        let total = self.probe.total_bytes();
        let loaded = self.loaded.lock().expect("registry lock poisoned");
        RegistryStats {
            device: self.probe.device_name(),
            total_mb: total / (1024 * 1024),
            used_mb: used / (1024 * 1024),
            available_mb: total.saturating_sub(used) / (1024 * 1024),
            usage_percent: if total > 0 {
                (used as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            },
            models_loaded: loaded.len(),
            models: loaded.values().cloned().collect(),
        }
    }

    /// Drop all registrations without touching the device. Used at
    /// shutdown, after workers have been torn down.
    pub fn clear(&self) {
        self.loaded.lock().expect("registry lock poisoned").clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Probe with adjustable readings.
    struct FakeProbe {
        used: AtomicU64,
        total: u64,
    }

    impl FakeProbe {
        fn boxed(used: u64, total: u64) -> Box<Self> {
            Box::new(Self {
                used: AtomicU64::new(used),
                total,
            })
        }
    }

    impl DeviceMemoryProbe for FakeProbe {
        fn used_bytes(&self) -> u64 {
            self.used.load(Ordering::Relaxed)
        }
        fn total_bytes(&self) -> u64 {
            self.total
        }
        fn device_name(&self) -> String {
            "FakeGPU 9000".to_string()
        }
    }

    const GB: u64 = 1024 * 1024 * 1024;

    fn info(name: &str, vram: u64) -> ModelInfo {
        ModelInfo {
            name: name.to_string(),
            model_path: format!("/models/{name}.safetensors"),
            vram_bytes: vram,
            worker_id: Some(0),
            loras: vec![],
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ModelRegistry::new(FakeProbe::boxed(GB, 8 * GB));
        assert!(!registry.is_loaded("sdxl"));

        registry.register(info("sdxl", 4 * GB));
        assert!(registry.is_loaded("sdxl"));

        registry.unregister("sdxl");
        assert!(!registry.is_loaded("sdxl"));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = ModelRegistry::new(FakeProbe::boxed(0, 8 * GB));
        registry.unregister("ghost");
    }

    #[test]
    fn can_fit_uses_live_availability() {
        let registry = ModelRegistry::new(FakeProbe::boxed(6 * GB, 8 * GB));
        assert!(registry.can_fit(GB));
        assert!(!registry.can_fit(3 * GB));
    }

    #[test]
    fn no_accelerator_never_fits() {
        let registry = ModelRegistry::new(Box::new(NullMemoryProbe));
        assert!(!registry.can_fit(1));
        assert_eq!(registry.available_bytes(), 0);
    }

    #[test]
    fn stats_reports_breakdown() {
        let registry = ModelRegistry::new(FakeProbe::boxed(2 * GB, 8 * GB));
        registry.register(info("a", GB));
        registry.register(info("b", GB));

        let stats = registry.stats();
        assert_eq!(stats.device, "FakeGPU 9000");
        assert_eq!(stats.models_loaded, 2);
        assert_eq!(stats.used_mb, 2 * 1024);
        assert_eq!(stats.available_mb, 6 * 1024);
        assert!((stats.usage_percent - 25.0).abs() < 0.1);
    }

    #[test]
    fn estimate_applies_overhead() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 1000]).unwrap();
        let est = ModelRegistry::estimate_model_vram(file.path());
        assert_eq!(est, 1200);
    }

    #[test]
    fn estimate_missing_file_is_zero() {
        assert_eq!(
            ModelRegistry::estimate_model_vram(Path::new("/definitely/not/here.safetensors")),
            0
        );
    }

    #[test]
    fn clear_drops_registrations() {
        let registry = ModelRegistry::new(FakeProbe::boxed(0, 8 * GB));
        registry.register(info("a", GB));
        registry.clear();
        assert_eq!(registry.stats().models_loaded, 0);
    }
}
