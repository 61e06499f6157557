//! Tiled neural inference for images of any size.
//!
//! An image is cut into overlapping fixed-size tiles, each tile runs through
//! an ONNX model, and the outputs are blended back together with a pyramid
//! falloff before an optional resample to the source resolution.

pub mod blend;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod instance;
pub mod logging;
pub mod process;
pub mod raster;
pub mod resample;
pub mod runtime;
pub mod tiling;

pub use error::{LoadError, PreconditionError, Result, RuntimeError, TileError};
pub use process::{run_tiled_inference, RunContext, TileParams};
