//! Tiled inference over a whole image.
//!
//! schedule -> per tile: extract, run, deposit -> normalize -> resample.
//! Tiles run one at a time on the calling thread. Cancellation is checked
//! between tiles; a cancelled or failed run produces no output image.

use std::time::Instant;

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blend::BlendAccumulator;
use crate::engine::{EngineShape, TileEngine};
use crate::error::{Result, RuntimeError, TileError};
use crate::extract::extract_tile;
use crate::raster::Image;
use crate::resample::ResamplePlan;
use crate::tiling::{OverlapRatio, TileSchedule};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileParams {
    pub overlap: OverlapRatio,
    /// Keep the model's output resolution instead of resampling back to the
    /// input size.
    pub keep_output_dimension: bool,
}

impl TileParams {
    pub fn new(overlap: f32, keep_output_dimension: bool) -> Result<Self> {
        Ok(Self {
            overlap: OverlapRatio::new(overlap)?,
            keep_output_dimension,
        })
    }
}

/// Called with `(completed, total)` once before the first tile and after
/// every tile.
pub type ProgressCallback = Box<dyn FnMut(usize, usize) + Send>;

#[derive(Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&mut self, completed: usize, total: usize) {
        if let Some(progress) = self.progress.as_mut() {
            progress(completed, total);
        }
    }
}

/// Everything about a run that is known before any tile executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub schedule: TileSchedule,
    pub accum_w: usize,
    pub accum_h: usize,
    pub resample: ResamplePlan,
    pub output_w: usize,
    pub output_h: usize,
}

impl RunPlan {
    pub fn new(image_w: usize, image_h: usize, shape: &EngineShape, params: &TileParams) -> Self {
        let schedule = TileSchedule::new(
            image_w,
            image_h,
            shape.input_w,
            shape.input_h,
            params.overlap,
        );
        let accum_w = image_w * shape.factor_w();
        let accum_h = image_h * shape.factor_h();
        let resample = ResamplePlan::choose(shape, params.keep_output_dimension);
        let (output_w, output_h) = match resample {
            ResamplePlan::Passthrough => (accum_w, accum_h),
            _ => (image_w, image_h),
        };
        Self {
            schedule,
            accum_w,
            accum_h,
            resample,
            output_w,
            output_h,
        }
    }
}

/// Run `engine` over `image` tile by tile and return the blended result.
///
/// The result always has 3 channels.
pub fn run_tiled_inference<E: TileEngine + ?Sized>(
    engine: &mut E,
    image: &Image,
    params: &TileParams,
    ctx: &mut RunContext,
) -> Result<Image> {
    image.check_supported()?;

    let shape = engine.shape();
    let plan = RunPlan::new(image.width(), image.height(), &shape, params);
    let total = plan.schedule.len();
    let started = Instant::now();

    debug!(
        image_w = image.width(),
        image_h = image.height(),
        tile_w = shape.input_w,
        tile_h = shape.input_h,
        step_x = plan.schedule.step_x,
        step_y = plan.schedule.step_y,
        overlap = params.overlap.get(),
        tiles = total,
        resample = %plan.resample,
        "Starting tiled inference"
    );

    let mut tile = Array4::<f32>::zeros(shape.input_dims());
    let mut accumulator = BlendAccumulator::new(plan.accum_w, plan.accum_h);
    let expected = shape.output_dims();

    ctx.report(0, total);
    for (completed, origin) in plan.schedule.origins().enumerate() {
        if ctx.cancel.is_cancelled() {
            debug!(completed, total, "Tiled inference cancelled");
            return Err(TileError::Cancelled { completed, total });
        }

        extract_tile(image, origin, &mut tile);
        let output = engine.run_tile(&tile)?;
        if output.shape() != expected {
            return Err(RuntimeError::OutputShape {
                expected,
                actual: output.shape().to_vec(),
            }
            .into());
        }
        accumulator.deposit(output, origin.scaled(shape.factor_w(), shape.factor_h()));
        ctx.report(completed + 1, total);
    }

    let blended = accumulator.normalize();
    let result = plan.resample.apply(blended, image.width(), image.height());

    debug!(
        tiles = total,
        output_w = result.width(),
        output_h = result.height(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tiled inference complete"
    );

    Ok(result)
}
