//! Weighted accumulation of output tiles.
//!
//! Each output tile is deposited with a separable triangular falloff that
//! peaks at the tile centre, so overlapping tiles cross-fade instead of
//! leaving seams. A parallel weight buffer records the weight each pixel
//! received; [`BlendAccumulator::normalize`] divides it out once at the end.

use ndarray::{Array2, Array3, Array4};

use crate::engine::TILE_CHANNELS;
use crate::raster::{Image, SampleFormat};
use crate::tiling::TileOrigin;

/// Weight used where the falloff reaches exactly zero (the first row and
/// column of even-sized tiles). Keeps every covered pixel's weight positive.
pub const WEIGHT_FLOOR: f32 = 0.001;

/// `0.5 - |pos - extent/2| / extent`, with integer halving of `extent`.
#[inline]
pub fn falloff(pos: usize, extent: usize) -> f32 {
    let centre = (extent / 2) as f32;
    0.5 - (pos as f32 - centre).abs() / extent as f32
}

/// Blend weight of output-tile sample `(x, y)`.
#[inline]
pub fn tile_weight(x: usize, y: usize, tile_w: usize, tile_h: usize) -> f32 {
    let w = falloff(x, tile_w) * falloff(y, tile_h);
    if w == 0.0 {
        WEIGHT_FLOOR
    } else {
        w
    }
}

pub struct BlendAccumulator {
    accum: Array3<f32>,
    weight: Array3<f32>,
    /// Per-tile weights, rebuilt only if the tile size changes.
    mask: Array2<f32>,
}

impl BlendAccumulator {
    /// Zero-filled 3-channel buffers of `width` x `height`.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            accum: Array3::zeros((TILE_CHANNELS, height, width)),
            weight: Array3::zeros((TILE_CHANNELS, height, width)),
            mask: Array2::zeros((0, 0)),
        }
    }

    pub fn width(&self) -> usize {
        self.accum.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.accum.shape()[1]
    }

    /// Add `tile` (`[1, 3, h, w]`) at `origin` in accumulation coordinates.
    /// Samples landing outside the buffer are skipped.
    pub fn deposit(&mut self, tile: &Array4<f32>, origin: TileOrigin) {
        let (tile_h, tile_w) = (tile.shape()[2], tile.shape()[3]);
        if self.mask.dim() != (tile_h, tile_w) {
            self.mask = Array2::from_shape_fn((tile_h, tile_w), |(y, x)| {
                tile_weight(x, y, tile_w, tile_h)
            });
        }

        let rows = tile_h.min(self.height().saturating_sub(origin.y));
        let cols = tile_w.min(self.width().saturating_sub(origin.x));

        for c in 0..TILE_CHANNELS {
            for y in 0..rows {
                let dy = origin.y + y;
                for x in 0..cols {
                    let dx = origin.x + x;
                    let w = self.mask[[y, x]];
                    self.accum[[c, dy, dx]] += tile[[0, c, y, x]] * w;
                    self.weight[[c, dy, dx]] += w;
                }
            }
        }
    }

    pub fn weight(&self) -> &Array3<f32> {
        &self.weight
    }

    /// Divide accumulated samples by accumulated weight. The weight buffer is
    /// dropped afterwards.
    pub fn normalize(self) -> Image {
        let Self {
            mut accum, weight, ..
        } = self;
        accum /= &weight;
        Image::new(accum, SampleFormat::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falloff_profile_even_tile() {
        let profile: Vec<f32> = (0..4).map(|x| falloff(x, 4)).collect();
        assert_eq!(profile, vec![0.0, 0.25, 0.5, 0.25]);
    }

    #[test]
    fn test_falloff_profile_odd_tile_is_positive() {
        assert!((0..5).all(|x| falloff(x, 5) > 0.0));
        assert!((falloff(2, 5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_weight_is_floored() {
        assert_eq!(tile_weight(0, 2, 4, 4), WEIGHT_FLOOR);
        assert_eq!(tile_weight(2, 0, 4, 4), WEIGHT_FLOOR);
        assert_eq!(tile_weight(2, 2, 4, 4), 0.25);
    }

    #[test]
    fn test_single_tile_normalizes_to_raw_output() {
        let tile = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, y, x)| (c + y * 4 + x) as f32);
        let mut acc = BlendAccumulator::new(4, 4);
        acc.deposit(&tile, TileOrigin { x: 0, y: 0 });
        let out = acc.normalize();
        for c in 0..3 {
            for y in 0..4 {
                for x in 0..4 {
                    let expected = (c + y * 4 + x) as f32;
                    assert!((out.sample(x, y, c) - expected).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_overlapping_constant_tiles_stay_constant() {
        let tile = Array4::from_elem((1, 3, 8, 8), 0.6);
        let mut acc = BlendAccumulator::new(12, 12);
        for &(x, y) in &[(0, 0), (4, 0), (0, 4), (4, 4), (8, 8)] {
            acc.deposit(&tile, TileOrigin { x, y });
        }
        assert!(acc.weight().iter().all(|&w| w > 0.0));
        let out = acc.normalize();
        assert!(out.data().iter().all(|&v| (v - 0.6).abs() < 1e-5));
    }

    #[test]
    fn test_samples_outside_buffer_are_skipped() {
        let tile = Array4::from_elem((1, 3, 4, 4), 1.0);
        let mut acc = BlendAccumulator::new(3, 3);
        acc.deposit(&tile, TileOrigin { x: 2, y: 2 });
        let weight = acc.weight();
        assert_eq!(weight[[0, 2, 2]], WEIGHT_FLOOR);
        assert_eq!(weight[[0, 1, 1]], 0.0);
        acc.deposit(&tile, TileOrigin { x: 5, y: 5 });
    }

    #[test]
    fn test_weight_mask_rebuilt_on_tile_size_change() {
        let mut acc = BlendAccumulator::new(8, 8);
        acc.deposit(&Array4::from_elem((1, 3, 4, 4), 1.0), TileOrigin { x: 0, y: 0 });
        acc.deposit(&Array4::from_elem((1, 3, 2, 2), 1.0), TileOrigin { x: 6, y: 6 });
        // 2x2 tile: falloff(1, 2) = 0.5 on both axes
        assert_eq!(acc.weight()[[1, 7, 7]], 0.25);
    }
}
