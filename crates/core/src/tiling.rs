//! Tile grid computation.
//!
//! Tiles advance by `tile * (1 - overlap)` pixels (truncated, at least 1) in
//! row-major order from the top-left corner. The last tile on an axis may
//! extend past the image; [`crate::extract`] clamps those reads to the edge.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TileError;

pub const DEFAULT_TILE_OVERLAP: f32 = 0.2;
pub const MIN_TILE_OVERLAP: f32 = 0.0;
pub const MAX_TILE_OVERLAP: f32 = 0.5;

/// Fraction of a tile shared with its neighbour, validated to `[0, 0.5]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct OverlapRatio(f32);

impl OverlapRatio {
    pub fn new(ratio: f32) -> Result<Self, TileError> {
        if ratio.is_nan() || !(MIN_TILE_OVERLAP..=MAX_TILE_OVERLAP).contains(&ratio) {
            return Err(TileError::InvalidOverlap(ratio));
        }
        Ok(Self(ratio))
    }

    pub fn get(self) -> f32 {
        self.0
    }

    /// Pixels between consecutive tile origins for a tile of `tile_dim` pixels.
    pub fn step_for(self, tile_dim: usize) -> usize {
        ((tile_dim as f32 * (1.0 - self.0)) as usize).max(1)
    }
}

impl Default for OverlapRatio {
    fn default() -> Self {
        Self(DEFAULT_TILE_OVERLAP)
    }
}

impl TryFrom<f32> for OverlapRatio {
    type Error = TileError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OverlapRatio> for f32 {
    fn from(value: OverlapRatio) -> Self {
        value.0
    }
}

impl fmt::Display for OverlapRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Top-left corner of one tile in input image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileOrigin {
    pub x: usize,
    pub y: usize,
}

impl TileOrigin {
    /// Matching corner in the upscaled accumulation buffer.
    pub fn scaled(self, factor_w: usize, factor_h: usize) -> Self {
        Self {
            x: self.x * factor_w,
            y: self.y * factor_h,
        }
    }
}

/// Ordered set of tile origins covering an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSchedule {
    pub image_w: usize,
    pub image_h: usize,
    pub tile_w: usize,
    pub tile_h: usize,
    pub step_x: usize,
    pub step_y: usize,
}

impl TileSchedule {
    pub fn new(
        image_w: usize,
        image_h: usize,
        tile_w: usize,
        tile_h: usize,
        overlap: OverlapRatio,
    ) -> Self {
        Self {
            image_w,
            image_h,
            tile_w,
            tile_h,
            step_x: overlap.step_for(tile_w),
            step_y: overlap.step_for(tile_h),
        }
    }

    pub fn columns(&self) -> usize {
        self.image_w.div_ceil(self.step_x)
    }

    pub fn rows(&self) -> usize {
        self.image_h.div_ceil(self.step_y)
    }

    /// Total tile count, known before any tile runs.
    pub fn len(&self) -> usize {
        self.columns() * self.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major origins; every origin is strictly inside the image.
    pub fn origins(&self) -> impl Iterator<Item = TileOrigin> + '_ {
        let (step_x, step_y) = (self.step_x, self.step_y);
        let columns = self.columns();
        (0..self.rows()).flat_map(move |row| {
            (0..columns).map(move |col| TileOrigin {
                x: col * step_x,
                y: row * step_y,
            })
        })
    }
}
