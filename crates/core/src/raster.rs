//! Planar `f32` raster and conversion to and from the `image` crate.
//!
//! Samples are normalized to `[0, 1]` and stored as `(channel, row, column)`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use ndarray::Array3;

use crate::error::PreconditionError;

/// Name reported in precondition failures.
pub const OPERATION_NAME: &str = "TiledInference";

/// Storage format of the samples an [`Image`] was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub bits_per_sample: u32,
    pub floating_point: bool,
    pub complex: bool,
}

impl SampleFormat {
    pub const U8: Self = Self::integer(8);
    pub const U16: Self = Self::integer(16);
    pub const F32: Self = Self::float(32);
    pub const F64: Self = Self::float(64);

    pub const fn integer(bits_per_sample: u32) -> Self {
        Self {
            bits_per_sample,
            floating_point: false,
            complex: false,
        }
    }

    pub const fn float(bits_per_sample: u32) -> Self {
        Self {
            bits_per_sample,
            floating_point: true,
            complex: false,
        }
    }

    pub const fn complex(bits_per_sample: u32) -> Self {
        Self {
            bits_per_sample,
            floating_point: true,
            complex: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Array3<f32>,
    format: SampleFormat,
}

impl Image {
    /// Wrap a `(channel, row, column)` array decoded from `format` samples.
    pub fn new(data: Array3<f32>, format: SampleFormat) -> Self {
        Self { data, format }
    }

    pub fn zeros(channels: usize, width: usize, height: usize) -> Self {
        Self::new(Array3::zeros((channels, height, width)), SampleFormat::F32)
    }

    pub fn from_planar(
        channels: usize,
        width: usize,
        height: usize,
        samples: Vec<f32>,
        format: SampleFormat,
    ) -> Result<Self> {
        let data = Array3::from_shape_vec((channels, height, width), samples)
            .with_context(|| format!("planar buffer does not match {channels}x{width}x{height}"))?;
        Ok(Self::new(data, format))
    }

    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    #[inline]
    pub fn sample(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.data[[channel, y, x]]
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Reject images the tiled transform cannot process.
    pub fn check_supported(&self) -> Result<(), PreconditionError> {
        if self.format.complex {
            return Err(PreconditionError::ComplexSamples {
                operation: OPERATION_NAME,
            });
        }
        if self.format.bits_per_sample == 64 {
            return Err(PreconditionError::WideSamples {
                operation: OPERATION_NAME,
            });
        }
        match self.channels() {
            1 | 3 => Ok(()),
            channels => Err(PreconditionError::UnsupportedChannels {
                operation: OPERATION_NAME,
                channels,
            }),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let decoded = image::open(path)
            .with_context(|| format!("failed to decode image: {}", path.display()))?;
        Ok(Self::from_dynamic(&decoded))
    }

    /// Convert keeping every source channel, alpha included, so that
    /// [`Image::check_supported`] sees the real channel count.
    pub fn from_dynamic(img: &DynamicImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        match img {
            DynamicImage::ImageLuma8(b) => planar(b.as_raw(), 1, w, h, SampleFormat::U8, norm_u8),
            DynamicImage::ImageLumaA8(b) => planar(b.as_raw(), 2, w, h, SampleFormat::U8, norm_u8),
            DynamicImage::ImageRgb8(b) => planar(b.as_raw(), 3, w, h, SampleFormat::U8, norm_u8),
            DynamicImage::ImageRgba8(b) => planar(b.as_raw(), 4, w, h, SampleFormat::U8, norm_u8),
            DynamicImage::ImageLuma16(b) => {
                planar(b.as_raw(), 1, w, h, SampleFormat::U16, norm_u16)
            }
            DynamicImage::ImageLumaA16(b) => {
                planar(b.as_raw(), 2, w, h, SampleFormat::U16, norm_u16)
            }
            DynamicImage::ImageRgb16(b) => {
                planar(b.as_raw(), 3, w, h, SampleFormat::U16, norm_u16)
            }
            DynamicImage::ImageRgba16(b) => {
                planar(b.as_raw(), 4, w, h, SampleFormat::U16, norm_u16)
            }
            DynamicImage::ImageRgb32F(b) => planar(b.as_raw(), 3, w, h, SampleFormat::F32, |v| v),
            DynamicImage::ImageRgba32F(b) => {
                planar(b.as_raw(), 4, w, h, SampleFormat::F32, |v| v)
            }
            other => {
                let rgb = other.to_rgb32f();
                planar(rgb.as_raw(), 3, w, h, SampleFormat::F32, |v| v)
            }
        }
    }

    /// Quantize to an 8- or 16-bit mono or RGB image, clamping to `[0, 1]`.
    pub fn to_dynamic(&self, bit_depth: u8) -> Result<DynamicImage> {
        let (w, h) = (self.width() as u32, self.height() as u32);
        let interleaved = |scale: f32| -> Vec<f32> {
            let mut out = Vec::with_capacity(self.data.len());
            for y in 0..self.height() {
                for x in 0..self.width() {
                    for c in 0..self.channels() {
                        out.push(self.sample(x, y, c).clamp(0.0, 1.0) * scale + 0.5);
                    }
                }
            }
            out
        };

        let img = match (self.channels(), bit_depth) {
            (1, 8) => {
                let raw = interleaved(255.0).into_iter().map(|v| v as u8).collect();
                ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(w, h, raw).map(DynamicImage::ImageLuma8)
            }
            (1, 16) => {
                let raw = interleaved(65535.0).into_iter().map(|v| v as u16).collect();
                ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(w, h, raw)
                    .map(DynamicImage::ImageLuma16)
            }
            (3, 8) => {
                let raw = interleaved(255.0).into_iter().map(|v| v as u8).collect();
                ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(w, h, raw).map(DynamicImage::ImageRgb8)
            }
            (3, 16) => {
                let raw = interleaved(65535.0).into_iter().map(|v| v as u16).collect();
                ImageBuffer::<Rgb<u16>, Vec<u16>>::from_raw(w, h, raw)
                    .map(DynamicImage::ImageRgb16)
            }
            (channels, depth) => {
                bail!("cannot encode {channels}-channel image at {depth} bits per sample")
            }
        };
        img.context("image buffer size does not match its dimensions")
    }

    pub fn save(&self, path: &Path, bit_depth: u8) -> Result<()> {
        self.to_dynamic(bit_depth)?
            .save(path)
            .with_context(|| format!("failed to write image: {}", path.display()))
    }
}

fn norm_u8(v: u8) -> f32 {
    v as f32 / 255.0
}

fn norm_u16(v: u16) -> f32 {
    v as f32 / 65535.0
}

fn planar<S: Copy>(
    raw: &[S],
    channels: usize,
    width: usize,
    height: usize,
    format: SampleFormat,
    norm: impl Fn(S) -> f32,
) -> Image {
    let data = Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
        norm(raw[(y * width + x) * channels + c])
    });
    Image::new(data, format)
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, RgbImage, RgbaImage};

    use super::*;

    #[test]
    fn test_from_luma8_is_single_channel_normalized() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 2, Luma([255])));
        let image = Image::from_dynamic(&img);
        assert_eq!(image.channels(), 1);
        assert_eq!((image.width(), image.height()), (4, 2));
        assert!((image.sample(3, 1, 0) - 1.0).abs() < 1e-6);
        assert!(image.check_supported().is_ok());
    }

    #[test]
    fn test_from_rgb8_keeps_channel_order() {
        let mut rgb = RgbImage::new(2, 2);
        rgb.put_pixel(1, 0, Rgb([255, 0, 51]));
        let image = Image::from_dynamic(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(image.channels(), 3);
        assert!((image.sample(1, 0, 0) - 1.0).abs() < 1e-6);
        assert_eq!(image.sample(1, 0, 1), 0.0);
        assert!((image.sample(1, 0, 2) - 0.2).abs() < 1e-6);
        assert_eq!(image.format(), SampleFormat::U8);
    }

    #[test]
    fn test_rgba_fails_precondition() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(3, 3));
        let err = Image::from_dynamic(&img)
            .check_supported()
            .expect_err("alpha channel should be rejected");
        assert_eq!(
            err,
            PreconditionError::UnsupportedChannels {
                operation: OPERATION_NAME,
                channels: 4
            }
        );
    }

    #[test]
    fn test_wide_and_complex_samples_rejected() {
        let wide = Image::new(Array3::zeros((3, 2, 2)), SampleFormat::F64);
        assert!(matches!(
            wide.check_supported(),
            Err(PreconditionError::WideSamples { .. })
        ));

        let complex = Image::new(Array3::zeros((1, 2, 2)), SampleFormat::complex(32));
        assert!(matches!(
            complex.check_supported(),
            Err(PreconditionError::ComplexSamples { .. })
        ));
    }

    #[test]
    fn test_to_dynamic_clamps_and_rounds() {
        let mut image = Image::zeros(3, 1, 1);
        image.data_mut()[[0, 0, 0]] = 1.7;
        image.data_mut()[[1, 0, 0]] = -0.3;
        image.data_mut()[[2, 0, 0]] = 0.5;
        let rgb = image.to_dynamic(8).expect("encode").to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 128]);
    }

    #[test]
    fn test_to_dynamic_rejects_unsupported_layout() {
        let image = Image::zeros(2, 1, 1);
        assert!(image.to_dynamic(8).is_err());
        assert!(Image::zeros(3, 1, 1).to_dynamic(12).is_err());
    }

    #[test]
    fn test_save_and_load_16bit_png() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.png");

        let mut image = Image::zeros(3, 3, 2);
        image.data_mut()[[1, 1, 2]] = 0.25;
        image.save(&path, 16).expect("save png");

        let loaded = Image::load(&path).expect("load png");
        assert_eq!(loaded.format(), SampleFormat::U16);
        assert_eq!((loaded.width(), loaded.height()), (3, 2));
        assert!((loaded.sample(2, 1, 1) - 0.25).abs() < 1e-4);
    }
}
