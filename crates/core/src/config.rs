use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{
    InferenceBackend, TransferMode, DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR,
};
use crate::process::TileParams;
use crate::tiling::OverlapRatio;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "TILEFUSE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub presets_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub tile_overlap: OverlapRatio,
    pub keep_output_dimension: bool,
    pub input_tensor: String,
    pub output_tensor: String,
    pub backend: InferenceBackend,
    pub transfer: TransferMode,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            presets_dir: PathBuf::from("presets"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tile_overlap: OverlapRatio::default(),
            keep_output_dimension: false,
            input_tensor: DEFAULT_INPUT_TENSOR.to_string(),
            output_tensor: DEFAULT_OUTPUT_TENSOR.to_string(),
            backend: InferenceBackend::default(),
            transfer: TransferMode::default(),
        }
    }
}

impl InferenceConfig {
    pub fn tile_params(&self) -> TileParams {
        TileParams {
            overlap: self.tile_overlap,
            keep_output_dimension: self.keep_output_dimension,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILEFUSE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
