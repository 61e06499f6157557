//! Typed errors for engine loading, per-tile execution and input validation.
//!
//! Library code returns these through [`TileError`]; the CLI wraps them in
//! `anyhow::Result` at call sites.
//!
//! Each variant maps to a stable integer code via `error_code()`:
//! - 1xx: engine load
//! - 2xx: tile execution
//! - 3xx: input preconditions
//! - 4xx: run control

use std::path::PathBuf;

use crate::engine::TensorRole;

/// Fatal errors raised while loading and validating a model artifact.
///
/// Nothing is partially constructed when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unable to open model file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to deserialize model from {path}: {reason}")]
    Deserialize { path: PathBuf, reason: String },

    #[error("{role} tensor {name} not found")]
    MissingTensor { role: TensorRole, name: String },

    #[error("{role} tensor {name} is not a runtime {role}")]
    WrongIoMode { role: TensorRole, name: String },

    #[error("{role} tensor {name} is not 4-dimensional (rank {rank})")]
    WrongRank {
        role: TensorRole,
        name: String,
        rank: usize,
    },

    #[error("{role} tensor {name} does not have 3 channels (found {channels})")]
    WrongChannels {
        role: TensorRole,
        name: String,
        channels: i64,
    },

    #[error("{role} tensor {name} is not 32-bit float (found {found})")]
    WrongElementType {
        role: TensorRole,
        name: String,
        found: String,
    },

    #[error("{role} tensor {name} has a dynamic or non-positive {axis} dimension ({value})")]
    UnresolvedDimension {
        role: TensorRole,
        name: String,
        axis: &'static str,
        value: i64,
    },

    #[error(
        "shape of output tensor {output} ({output_w}x{output_h}) is not a multiple of input tensor {input} ({input_w}x{input_h})"
    )]
    NotMultiple {
        input: String,
        output: String,
        input_w: usize,
        input_h: usize,
        output_w: usize,
        output_h: usize,
    },

    #[error("failed to create execution context: {0}")]
    Context(String),
}

/// Fatal errors raised while running a single tile. The whole image is aborted.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to send image tile to device: {0}")]
    Upload(String),

    #[error("failed to run inference on image tile: {0}")]
    Execute(String),

    #[error("failed to receive image tile from device: {0}")]
    Download(String),

    #[error("output tile shape mismatch: expected {expected:?}, got {actual:?}")]
    OutputShape {
        expected: [usize; 4],
        actual: Vec<usize>,
    },

    #[error("failed to synchronize device: {0}")]
    Synchronize(String),
}

/// Image properties the tiled inference transform refuses to operate on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("{operation} cannot be executed on complex images")]
    ComplexSamples { operation: &'static str },

    #[error("{operation} cannot be executed on 64-bit images")]
    WideSamples { operation: &'static str },

    #[error("{operation} can only be executed on single-channel or RGB images (found {channels} channels)")]
    UnsupportedChannels {
        operation: &'static str,
        channels: usize,
    },
}

/// Everything a tiled inference run can fail with.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("tile overlap {0} is outside [0, 0.5]")]
    InvalidOverlap(f32),

    #[error("process aborted after {completed} of {total} tiles")]
    Cancelled { completed: usize, total: usize },
}

impl LoadError {
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Unreadable { .. } => 100,
            Self::Deserialize { .. } => 101,
            Self::MissingTensor { .. } => 102,
            Self::WrongIoMode { .. } => 103,
            Self::WrongRank { .. } => 104,
            Self::WrongChannels { .. } => 105,
            Self::WrongElementType { .. } => 106,
            Self::UnresolvedDimension { .. } => 107,
            Self::NotMultiple { .. } => 108,
            Self::Context(_) => 109,
        }
    }
}

impl RuntimeError {
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Upload(_) => 200,
            Self::Execute(_) => 201,
            Self::Download(_) => 202,
            Self::OutputShape { .. } => 203,
            Self::Synchronize(_) => 204,
        }
    }
}

impl TileError {
    /// Stable integer error code for structured logging.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Load(e) => e.error_code(),
            Self::Runtime(e) => e.error_code(),
            Self::Precondition(PreconditionError::ComplexSamples { .. }) => 300,
            Self::Precondition(PreconditionError::WideSamples { .. }) => 301,
            Self::Precondition(PreconditionError::UnsupportedChannels { .. }) => 302,
            Self::InvalidOverlap(_) => 400,
            Self::Cancelled { .. } => 401,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, TileError>;
