//! Execution provider selection and session construction.
//!
//! Provides [`InferenceBackend`] and [`build_session`], which commits an
//! in-memory model to an `ort::Session` with the requested execution providers
//! and optional TensorRT engine caching.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries (`libnvinfer.so.10` or `nvinfer.dll`)
/// to be installed; if unavailable, the session falls back to CUDA EP automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    /// Serialized model, read whole from `model_path`.
    pub model: &'a [u8],
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    if !root.exists() {
        return CacheStats::default();
    }

    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
    }

    stats
}

/// Build an `ort::Session` with the requested backend and fallback chain.
///
/// For `InferenceBackend::Tensorrt`:
///   - Registers TRT EP with engine caching, then CUDA EP as fallback.
///   - If TRT runtime is unavailable, CUDA EP is used automatically.
///
/// For `InferenceBackend::Cuda`:
///   - Registers CUDA EP only; ORT falls back to CPU when it is unavailable.
///
/// `InferenceBackend::Cpu` registers no execution provider.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_stats(cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let cache_dir_for_log = cache_dir.display().to_string();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                cache_dir = %cache_dir_for_log,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += 15;
                        }
                    }
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_memory(config.model)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            let after = cache_stats(cache_dir);
            match session_result {
                Ok(session) => {
                    if after.file_count > before.file_count || after.total_bytes > before.total_bytes
                    {
                        info!(
                            elapsed_secs = elapsed,
                            cache_dir = %cache_dir.display(),
                            cache_files_before = before.file_count,
                            cache_files_after = after.file_count,
                            "TensorRT session ready; engine cache updated"
                        );
                    } else {
                        info!(
                            elapsed_secs = elapsed,
                            cache_dir = %cache_dir.display(),
                            cache_files = after.file_count,
                            "TensorRT session ready; using existing cache"
                        );
                    }
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        cache_files_before = before.file_count,
                        cache_files_after = after.file_count,
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_memory(config.model)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without execution providers");

            builder.commit_from_memory(config.model).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
        }
    };

    Ok(session)
}

/// First 16 hex digits of the SHA-256 of a serialized model.
pub fn model_hash(model: &[u8]) -> String {
    let digest = Sha256::digest(model);
    let digest_hex = format!("{digest:x}");
    digest_hex[..16].to_string()
}

/// Engine caches are kept per model: `<base_dir>/<model_hash>`.
pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy("TensorRT"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("Cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("unknown"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cuda);
    }

    #[test]
    fn test_backend_display_matches_serde() {
        for backend in [
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
            InferenceBackend::Cpu,
        ] {
            let json = serde_json::to_string(&backend).expect("serialize backend");
            assert_eq!(json, format!("\"{backend}\""));
        }
    }

    #[test]
    fn test_model_hash_is_stable_prefix() {
        let hash = model_hash(b"abc");
        assert_eq!(hash, "ba7816bf8f01cfea");
        assert_ne!(model_hash(b"abd"), hash);
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("ba7816bf8f01cfea")),
            PathBuf::from("trt_cache/ba7816bf8f01cfea")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }

    #[test]
    fn test_cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("a.engine"), [0u8; 10]).expect("write");
        std::fs::write(dir.path().join("sub/b.engine"), [0u8; 5]).expect("write");

        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(cache_stats(&dir.path().join("missing")).file_count, 0);
    }
}
