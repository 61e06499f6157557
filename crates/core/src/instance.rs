//! Process instances and their JSON presets.
//!
//! A [`ProcessInstance`] is tagged with the process it parameterizes, so a
//! preset written for another process is rejected by name before any of its
//! parameters are read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::InferenceConfig;
use crate::engine::{EngineOptions, DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR};
use crate::process::TileParams;
use crate::raster::OPERATION_NAME;
use crate::tiling::OverlapRatio;

const PRESET_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("failed to read preset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write preset {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse preset {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("preset {path} is for process {found}, not TiledInference")]
    UnknownProcess { path: PathBuf, found: String },

    #[error("invalid preset name {0:?}")]
    InvalidName(String),
}

/// Parameters of one tiled inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceInstance {
    pub model_path: PathBuf,
    pub tile_overlap: OverlapRatio,
    pub keep_output_dimension: bool,
    pub input_tensor: String,
    pub output_tensor: String,
}

impl Default for InferenceInstance {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            tile_overlap: OverlapRatio::default(),
            keep_output_dimension: false,
            input_tensor: DEFAULT_INPUT_TENSOR.to_string(),
            output_tensor: DEFAULT_OUTPUT_TENSOR.to_string(),
        }
    }
}

impl InferenceInstance {
    pub fn from_config(config: &InferenceConfig, model_path: PathBuf) -> Self {
        Self {
            model_path,
            tile_overlap: config.tile_overlap,
            keep_output_dimension: config.keep_output_dimension,
            input_tensor: config.input_tensor.clone(),
            output_tensor: config.output_tensor.clone(),
        }
    }

    /// Copy every parameter from `other` if it is a tiled inference instance.
    /// Returns whether anything was copied.
    pub fn assign(&mut self, other: &ProcessInstance) -> bool {
        match other {
            ProcessInstance::TiledInference(source) => {
                self.clone_from(source);
                true
            }
        }
    }

    pub fn tile_params(&self) -> TileParams {
        TileParams {
            overlap: self.tile_overlap,
            keep_output_dimension: self.keep_output_dimension,
        }
    }

    /// `base` with this instance's tensor names.
    pub fn engine_options(&self, base: EngineOptions) -> EngineOptions {
        EngineOptions {
            input_tensor: self.input_tensor.clone(),
            output_tensor: self.output_tensor.clone(),
            ..base
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "process")]
pub enum ProcessInstance {
    TiledInference(InferenceInstance),
}

impl ProcessInstance {
    /// Names accepted in the `process` tag.
    pub const KINDS: &'static [&'static str] = &[OPERATION_NAME];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TiledInference(_) => OPERATION_NAME,
        }
    }

    pub fn as_inference(&self) -> Option<&InferenceInstance> {
        match self {
            Self::TiledInference(instance) => Some(instance),
        }
    }
}

impl From<InferenceInstance> for ProcessInstance {
    fn from(instance: InferenceInstance) -> Self {
        Self::TiledInference(instance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instance: ProcessInstance,
}

impl Preset {
    pub fn new(name: impl Into<String>, instance: impl Into<ProcessInstance>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instance: instance.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PresetError> {
        let raw = fs::read_to_string(path).map_err(|source| PresetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| PresetError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(found) = value
            .get("instance")
            .and_then(|instance| instance.get("process"))
            .and_then(|process| process.as_str())
        {
            if !ProcessInstance::KINDS.contains(&found) {
                return Err(PresetError::UnknownProcess {
                    path: path.to_path_buf(),
                    found: found.to_string(),
                });
            }
        }

        serde_json::from_value(value).map_err(|source| PresetError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), PresetError> {
        let write_err = |source| PresetError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let encoded = serde_json::to_string_pretty(self).map_err(|source| PresetError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, encoded).map_err(write_err)
    }
}

/// `<dir>/<name>.json`, rejecting names that would escape `dir`.
pub fn preset_path(dir: &Path, name: &str) -> Result<PathBuf, PresetError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains("..")
    {
        return Err(PresetError::InvalidName(name.to_string()));
    }
    Ok(dir.join(format!("{trimmed}.{PRESET_EXTENSION}")))
}

/// Every readable preset in `dir`, keyed by file stem. Unreadable or foreign
/// presets are logged and skipped.
pub fn load_presets(dir: &Path) -> BTreeMap<String, Preset> {
    let mut presets = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read presets directory {}: {e}", dir.display());
            return presets;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PRESET_EXTENSION) {
            continue;
        }
        let slug = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        match Preset::load(&path) {
            Ok(preset) => {
                info!(id = %slug, name = %preset.name, "Loaded preset");
                presets.insert(slug, preset);
            }
            Err(e) => warn!("{e}"),
        }
    }

    presets
}
