//! Mode configuration: named recipes binding a base model, a LoRA stack,
//! and default generation parameters.
//!
//! Modes live in a declarative YAML document (`modes.yaml`) and are
//! immutable once read; an explicit admin reload re-reads the file. The
//! worker pool consumes modes through the [`ModeProvider`] trait so tests
//! can substitute a fixture provider.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;

use crate::error::{CoreError, ErrorKind};
use crate::job::{GenerateDefaults, ImageSize};

/// A LoRA adapter applied atop the base model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSpec {
    pub path: String,
    pub strength: f64,
}

/// YAML accepts two shapes for a LoRA entry: a bare path string (strength
/// 1.0) or an explicit `{path, strength}` map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoraEntry {
    Bare(String),
    Full { path: String, #[serde(default = "default_strength")] strength: f64 },
}

fn default_strength() -> f64 {
    1.0
}

impl From<LoraEntry> for LoraSpec {
    fn from(entry: LoraEntry) -> Self {
        match entry {
            LoraEntry::Bare(path) => LoraSpec {
                path,
                strength: 1.0,
            },
            LoraEntry::Full { path, strength } => LoraSpec { path, strength },
        }
    }
}

/// One named mode, as validated and normalized from the document.
#[derive(Debug, Clone)]
pub struct ModeSpec {
    pub name: String,
    /// Model file name, relative to `model_root`.
    pub model: String,
    /// Absolute path to the model file.
    pub model_path: PathBuf,
    pub loras: Vec<LoraSpec>,
    pub default_size: ImageSize,
    pub default_steps: u32,
    pub default_guidance: f64,
}

impl ModeSpec {
    /// Generation defaults applied when a submit omits params.
    pub fn defaults(&self) -> GenerateDefaults {
        GenerateDefaults {
            size: self.default_size,
            steps: self.default_steps,
            guidance: self.default_guidance,
        }
    }
}

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ModesDocument {
    default_mode: String,
    model_root: PathBuf,
    #[serde(default)]
    lora_root: Option<PathBuf>,
    modes: BTreeMap<String, ModeEntry>,
}

#[derive(Debug, Deserialize)]
struct ModeEntry {
    model: String,
    #[serde(default)]
    loras: Vec<LoraEntry>,
    #[serde(default = "default_size")]
    default_size: String,
    #[serde(default = "default_steps")]
    default_steps: u32,
    #[serde(default = "default_guidance")]
    default_guidance: f64,
}

fn default_size() -> String {
    "512x512".to_string()
}
fn default_steps() -> u32 {
    4
}
fn default_guidance() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Read access to the mode catalogue. The pool and the session router
/// depend on this trait, never on the concrete loader.
pub trait ModeProvider: Send + Sync {
    /// Look up a mode by name.
    fn get(&self, name: &str) -> Result<ModeSpec, CoreError>;
    /// Name of the configured default mode.
    fn default_mode(&self) -> String;
    /// All mode names, sorted.
    fn list(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Parsed, validated snapshot of the modes document.
#[derive(Debug, Clone)]
struct ModeCatalogue {
    default_mode: String,
    modes: BTreeMap<String, ModeSpec>,
}

/// File-backed [`ModeProvider`] with explicit reload.
#[derive(Debug)]
pub struct ModeConfig {
    path: PathBuf,
    catalogue: RwLock<ModeCatalogue>,
}

impl ModeConfig {
    /// Load and validate the modes document. Any structural problem is
    /// fatal: a service with no valid mode catalogue cannot start.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let catalogue = Self::read_catalogue(&path)?;
        Ok(Self {
            path,
            catalogue: RwLock::new(catalogue),
        })
    }

    /// Re-read the document from disk. On failure the previous catalogue
    /// stays in effect and the error is returned to the admin caller.
    pub fn reload(&self) -> Result<usize, CoreError> {
        let fresh = Self::read_catalogue(&self.path)?;
        let count = fresh.modes.len();
        *self.catalogue.write().expect("mode catalogue lock poisoned") = fresh;
        tracing::info!(count, path = %self.path.display(), "Mode configuration reloaded");
        Ok(count)
    }

    fn read_catalogue(path: &Path) -> Result<ModeCatalogue, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::new(
                ErrorKind::ModeNotFound,
                format!("cannot read modes config {}: {e}", path.display()),
            )
        })?;

        let doc: ModesDocument = serde_yaml::from_str(&raw).map_err(|e| {
            CoreError::new(
                ErrorKind::ModeNotFound,
                format!("invalid modes config {}: {e}", path.display()),
            )
        })?;

        if doc.modes.is_empty() {
            return Err(CoreError::new(
                ErrorKind::ModeNotFound,
                "modes config defines no modes",
            ));
        }

        let lora_root = doc
            .lora_root
            .unwrap_or_else(|| doc.model_root.join("loras"));

        let mut modes = BTreeMap::new();
        for (name, entry) in doc.modes {
            let default_size = ImageSize::parse(&entry.default_size).map_err(|e| {
                CoreError::new(
                    ErrorKind::ModeNotFound,
                    format!("mode '{name}': {}", e.message),
                )
            })?;

            let loras = entry
                .loras
                .into_iter()
                .map(LoraSpec::from)
                .map(|mut lora| {
                    // Bare file names resolve under lora_root; absolute
                    // paths pass through untouched.
                    if !Path::new(&lora.path).is_absolute() {
                        lora.path = lora_root.join(&lora.path).to_string_lossy().into_owned();
                    }
                    lora
                })
                .collect();

            let model_path = doc.model_root.join(&entry.model);
            modes.insert(
                name.clone(),
                ModeSpec {
                    name,
                    model: entry.model,
                    model_path,
                    loras,
                    default_size,
                    default_steps: entry.default_steps,
                    default_guidance: entry.default_guidance,
                },
            );
        }

        if !modes.contains_key(&doc.default_mode) {
            return Err(CoreError::new(
                ErrorKind::ModeNotFound,
                format!(
                    "default_mode '{}' not found. Available modes: {:?}",
                    doc.default_mode,
                    modes.keys().collect::<Vec<_>>()
                ),
            ));
        }

        Ok(ModeCatalogue {
            default_mode: doc.default_mode,
            modes,
        })
    }
}

impl ModeProvider for ModeConfig {
    fn get(&self, name: &str) -> Result<ModeSpec, CoreError> {
        let found = {
            let catalogue = self.catalogue.read().expect("mode catalogue lock poisoned");
            catalogue.modes.get(name).cloned()
        };
        found.ok_or_else(|| CoreError::mode_not_found(name, &self.list()))
    }

    fn default_mode(&self) -> String {
        self.catalogue
            .read()
            .expect("mode catalogue lock poisoned")
            .default_mode
            .clone()
    }

    fn list(&self) -> Vec<String> {
        self.catalogue
            .read()
            .expect("mode catalogue lock poisoned")
            .modes
            .keys()
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
