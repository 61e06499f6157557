//! Output resampling: reconcile the accumulated resolution (input size times
//! the model scale factor) with the requested output size.

use ndarray::Array3;

use crate::engine::EngineShape;
use crate::raster::{Image, SampleFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplePlan {
    /// Keep the accumulated resolution.
    Passthrough,
    /// Average `f x f` blocks; used when both axes scale by the same integer.
    Decimate(usize),
    /// Separable cubic B-spline resample by `1/factor_w`, `1/factor_h`.
    Fractional { factor_w: usize, factor_h: usize },
}

impl ResamplePlan {
    pub fn choose(shape: &EngineShape, keep_output_dimension: bool) -> Self {
        let (factor_w, factor_h) = (shape.factor_w(), shape.factor_h());
        if keep_output_dimension || (factor_w == 1 && factor_h == 1) {
            Self::Passthrough
        } else if factor_w > 1 && factor_w == factor_h {
            Self::Decimate(factor_w)
        } else {
            Self::Fractional { factor_w, factor_h }
        }
    }

    /// Apply the plan. `target_w` x `target_h` is the original input size and
    /// is only used by the non-passthrough paths.
    pub fn apply(self, image: Image, target_w: usize, target_h: usize) -> Image {
        match self {
            Self::Passthrough => image,
            Self::Decimate(factor) => decimate(&image, factor),
            Self::Fractional { .. } => resample_bspline(&image, target_w, target_h),
        }
    }
}

impl std::fmt::Display for ResamplePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough => write!(f, "passthrough"),
            Self::Decimate(factor) => write!(f, "decimate 1/{factor}"),
            Self::Fractional { factor_w, factor_h } => {
                write!(f, "cubic b-spline 1/{factor_w} x 1/{factor_h}")
            }
        }
    }
}

/// Box-average `factor x factor` blocks.
pub fn decimate(image: &Image, factor: usize) -> Image {
    let (channels, out_h, out_w) = (
        image.channels(),
        image.height() / factor,
        image.width() / factor,
    );
    let src = image.data();
    let area = (factor * factor) as f32;

    let data = Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
        let mut sum = 0.0f32;
        for dy in 0..factor {
            for dx in 0..factor {
                sum += src[[c, y * factor + dy, x * factor + dx]];
            }
        }
        sum / area
    });
    Image::new(data, SampleFormat::F32)
}

/// Cubic B-spline kernel, support `[-2, 2]`.
#[inline]
pub fn cubic_bspline(t: f32) -> f32 {
    let t = t.abs();
    if t < 1.0 {
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0
    } else if t < 2.0 {
        let u = 2.0 - t;
        u * u * u / 6.0
    } else {
        0.0
    }
}

/// Source taps for each destination sample along one axis. When shrinking,
/// the kernel is stretched by the inverse scale so every source pixel
/// contributes. Taps past either edge are clamped; weights sum to 1.
///
/// The stretched support has radius `2 / scale` (up to 12 taps at 3x), so
/// shrunk output is smoother than a filter of radius `factor / 2` gives.
fn axis_taps(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = dst_len as f32 / src_len as f32;
    let stretch = if scale < 1.0 { 1.0 / scale } else { 1.0 };
    let radius = 2.0 * stretch;
    let last = src_len as isize - 1;

    (0..dst_len)
        .map(|dst| {
            let centre = (dst as f32 + 0.5) / scale - 0.5;
            let first = (centre - radius).floor() as isize;
            let end = (centre + radius).ceil() as isize;

            let mut taps: Vec<(usize, f32)> = (first..=end)
                .filter_map(|i| {
                    let w = cubic_bspline((i as f32 - centre) / stretch);
                    (w > 0.0).then(|| (i.clamp(0, last) as usize, w))
                })
                .collect();

            let total: f32 = taps.iter().map(|&(_, w)| w).sum();
            if total > 0.0 {
                for tap in &mut taps {
                    tap.1 /= total;
                }
            }
            taps
        })
        .collect()
}

/// Separable cubic B-spline resample to exactly `out_w` x `out_h`.
pub fn resample_bspline(image: &Image, out_w: usize, out_h: usize) -> Image {
    let channels = image.channels();
    let (in_w, in_h) = (image.width(), image.height());
    let src = image.data();

    let horizontal = if out_w == in_w {
        src.clone()
    } else {
        let taps = axis_taps(in_w, out_w);
        Array3::from_shape_fn((channels, in_h, out_w), |(c, y, x)| {
            taps[x].iter().map(|&(sx, w)| src[[c, y, sx]] * w).sum()
        })
    };

    let data = if out_h == in_h {
        horizontal
    } else {
        let taps = axis_taps(in_h, out_h);
        Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
            taps[y].iter().map(|&(sy, w)| horizontal[[c, sy, x]] * w).sum()
        })
    };

    Image::new(data, SampleFormat::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(in_w: usize, in_h: usize, out_w: usize, out_h: usize) -> EngineShape {
        EngineShape::new(in_w, in_h, out_w, out_h).expect("valid shape")
    }

    #[test]
    fn test_shrink_support_widens_with_factor() {
        let taps = axis_taps(20, 10);
        let interior = &taps[5];
        // centre 10.5, |i - 10.5| < 4
        assert_eq!(interior.len(), 8);
        assert_eq!(interior.first().map(|t| t.0), Some(7));
        assert_eq!(interior.last().map(|t| t.0), Some(14));
        let total: f32 = interior.iter().map(|t| t.1).sum();
        assert!((total - 1.0).abs() < 1e-5);

        let upscale = axis_taps(10, 20);
        assert!(upscale.iter().all(|t| t.len() <= 4));
    }

    #[test]
    fn test_plan_selection() {
        assert_eq!(
            ResamplePlan::choose(&shape(64, 64, 128, 128), false),
            ResamplePlan::Decimate(2)
        );
        assert_eq!(
            ResamplePlan::choose(&shape(64, 64, 128, 128), true),
            ResamplePlan::Passthrough
        );
        assert_eq!(
            ResamplePlan::choose(&shape(64, 64, 64, 64), false),
            ResamplePlan::Passthrough
        );
        assert_eq!(
            ResamplePlan::choose(&shape(64, 64, 128, 192), false),
            ResamplePlan::Fractional {
                factor_w: 2,
                factor_h: 3
            }
        );
        assert_eq!(
            ResamplePlan::choose(&shape(64, 64, 64, 128), false),
            ResamplePlan::Fractional {
                factor_w: 1,
                factor_h: 2
            }
        );
    }

    #[test]
    fn test_decimate_averages_blocks() {
        let data = Array3::from_shape_vec(
            (1, 2, 4),
            vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 10.0, 30.0],
        )
        .expect("shape");
        let out = decimate(&Image::new(data, SampleFormat::F32), 2);
        assert_eq!((out.width(), out.height()), (2, 1));
        assert_eq!(out.sample(0, 0, 0), 4.0);
        assert_eq!(out.sample(1, 0, 0), 15.0);
    }

    #[test]
    fn test_bspline_kernel_partition_of_unity() {
        for i in 0..10 {
            let offset = i as f32 / 10.0;
            let sum: f32 = (-3..=3).map(|k| cubic_bspline(k as f32 - offset)).sum();
            assert!((sum - 1.0).abs() < 1e-5, "offset {offset}: {sum}");
        }
        assert_eq!(cubic_bspline(2.0), 0.0);
        assert!((cubic_bspline(0.0) - 4.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_fractional_hits_exact_dimensions() {
        let image = Image::zeros(3, 200, 300);
        let out = ResamplePlan::Fractional {
            factor_w: 2,
            factor_h: 3,
        }
        .apply(image, 100, 100);
        assert_eq!((out.width(), out.height(), out.channels()), (100, 100, 3));
    }

    #[test]
    fn test_fractional_preserves_constant() {
        let data = Array3::from_elem((3, 21, 14), 0.4);
        let out = resample_bspline(&Image::new(data, SampleFormat::F32), 7, 7);
        assert!(out.data().iter().all(|&v| (v - 0.4).abs() < 1e-5));
    }

    #[test]
    fn test_fractional_smooths_without_overshoot() {
        let data = Array3::from_shape_fn((1, 1, 40), |(_, _, x)| if x < 20 { 0.0 } else { 1.0 });
        let out = resample_bspline(&Image::new(data, SampleFormat::F32), 20, 1);
        let row: Vec<f32> = (0..20).map(|x| out.sample(x, 0, 0)).collect();
        assert!(row.iter().all(|&v| (-1e-6..=1.0 + 1e-6).contains(&v)));
        assert!(row.windows(2).all(|w| w[1] >= w[0] - 1e-6));
        assert!(row[0] < 1e-6 && row[19] > 1.0 - 1e-6);
    }

    #[test]
    fn test_passthrough_returns_input() {
        let image = Image::zeros(3, 8, 6);
        let out = ResamplePlan::Passthrough.apply(image.clone(), 4, 3);
        assert_eq!(out, image);
    }
}
