//! Engine binding: a model that maps fixed-size RGB tiles to fixed-size RGB tiles.
//!
//! [`TileEngine`] is the seam between the tiling pipeline and the inference
//! runtime. [`OrtEngine`] implements it on ONNX Runtime; tests drive the
//! pipeline with in-process engines.

pub mod backend;
pub mod onnx;

use std::fmt;
use std::sync::Arc;

use ndarray::Array4;
use serde::Serialize;

use crate::error::{LoadError, RuntimeError};

pub use onnx::{EngineOptions, OrtEngine, TransferMode};
pub use backend::InferenceBackend;

/// Channel count every tile tensor must carry.
pub const TILE_CHANNELS: usize = 3;

pub const DEFAULT_INPUT_TENSOR: &str = "input";
pub const DEFAULT_OUTPUT_TENSOR: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    Input,
    Output,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A tensor as declared by a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub role: TensorRole,
    /// Human-readable data type, e.g. "float32", "float16".
    pub data_type: String,
    /// Dimensions. `-1` represents a dynamic/symbolic dimension.
    pub shape: Vec<i64>,
}

/// Tile dimensions fixed at load time.
///
/// Output dimensions are exact integer multiples of the input dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineShape {
    pub input_w: usize,
    pub input_h: usize,
    pub output_w: usize,
    pub output_h: usize,
}

impl EngineShape {
    pub fn new(
        input_w: usize,
        input_h: usize,
        output_w: usize,
        output_h: usize,
    ) -> Result<Self, LoadError> {
        let shape = Self {
            input_w,
            input_h,
            output_w,
            output_h,
        };
        shape.check_multiple(DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR)?;
        Ok(shape)
    }

    /// Validate the named tensors among those a model declares, in order:
    /// input presence, I/O mode, rank, channels, element type and static
    /// spatial size, then the same for the output, then the scale multiple.
    pub fn from_tensors(
        tensors: &[TensorInfo],
        input_name: &str,
        output_name: &str,
    ) -> Result<Self, LoadError> {
        let (input_h, input_w) = check_tensor(tensors, input_name, TensorRole::Input)?;
        let (output_h, output_w) = check_tensor(tensors, output_name, TensorRole::Output)?;
        let shape = Self {
            input_w,
            input_h,
            output_w,
            output_h,
        };
        shape.check_multiple(input_name, output_name)?;
        Ok(shape)
    }

    fn check_multiple(&self, input_name: &str, output_name: &str) -> Result<(), LoadError> {
        let zero = self.input_w == 0 || self.input_h == 0;
        if zero || self.output_w % self.input_w != 0 || self.output_h % self.input_h != 0 {
            return Err(LoadError::NotMultiple {
                input: input_name.to_string(),
                output: output_name.to_string(),
                input_w: self.input_w,
                input_h: self.input_h,
                output_w: self.output_w,
                output_h: self.output_h,
            });
        }
        Ok(())
    }

    pub fn factor_w(&self) -> usize {
        self.output_w / self.input_w
    }

    pub fn factor_h(&self) -> usize {
        self.output_h / self.input_h
    }

    /// NCHW dimensions of one input tile with batch fixed to 1.
    pub fn input_dims(&self) -> [usize; 4] {
        [1, TILE_CHANNELS, self.input_h, self.input_w]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [1, TILE_CHANNELS, self.output_h, self.output_w]
    }
}

impl fmt::Display for EngineShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} -> {}x{} (x{}, x{})",
            self.input_w,
            self.input_h,
            self.output_w,
            self.output_h,
            self.factor_w(),
            self.factor_h()
        )
    }
}

fn check_tensor(
    tensors: &[TensorInfo],
    name: &str,
    role: TensorRole,
) -> Result<(usize, usize), LoadError> {
    let tensor = tensors
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| LoadError::MissingTensor {
            role,
            name: name.to_string(),
        })?;

    if tensor.role != role {
        return Err(LoadError::WrongIoMode {
            role,
            name: name.to_string(),
        });
    }
    if tensor.shape.len() != 4 {
        return Err(LoadError::WrongRank {
            role,
            name: name.to_string(),
            rank: tensor.shape.len(),
        });
    }
    if tensor.shape[1] != TILE_CHANNELS as i64 {
        return Err(LoadError::WrongChannels {
            role,
            name: name.to_string(),
            channels: tensor.shape[1],
        });
    }
    if tensor.data_type != "float32" {
        return Err(LoadError::WrongElementType {
            role,
            name: name.to_string(),
            found: tensor.data_type.clone(),
        });
    }

    let spatial = |axis: &'static str, value: i64| -> Result<usize, LoadError> {
        if value <= 0 {
            return Err(LoadError::UnresolvedDimension {
                role,
                name: name.to_string(),
                axis,
                value,
            });
        }
        Ok(value as usize)
    };
    Ok((
        spatial("height", tensor.shape[2])?,
        spatial("width", tensor.shape[3])?,
    ))
}

/// Runs one tile at a time through a loaded model.
pub trait TileEngine {
    fn shape(&self) -> EngineShape;

    /// Run one `[1, 3, input_h, input_w]` tile and return the
    /// `[1, 3, output_h, output_w]` result. Blocks until the output is on
    /// the host. The returned buffer is reused by the next call.
    fn run_tile(&mut self, tile: &Array4<f32>) -> Result<&Array4<f32>, RuntimeError>;
}

impl<E: TileEngine + ?Sized> TileEngine for Box<E> {
    fn shape(&self) -> EngineShape {
        (**self).shape()
    }

    fn run_tile(&mut self, tile: &Array4<f32>) -> Result<&Array4<f32>, RuntimeError> {
        (**self).run_tile(tile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Verbose,
}

/// Diagnostic sink handed to an engine at load time.
pub trait EngineLog: Send + Sync {
    fn log(&self, severity: Severity, message: &str);
}

/// Forwards engine diagnostics to `tracing` under the `engine` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl EngineLog for TracingLog {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Error => tracing::error!(target: "engine", "{message}"),
            Severity::Warning => tracing::warn!(target: "engine", "{message}"),
            Severity::Info => tracing::info!(target: "engine", "{message}"),
            Severity::Verbose => tracing::debug!(target: "engine", "{message}"),
        }
    }
}

pub fn default_log() -> Arc<dyn EngineLog> {
    Arc::new(TracingLog)
}
