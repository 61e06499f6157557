use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilefuse_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use tilefuse_core::engine::{
    EngineOptions, EngineShape, InferenceBackend, OrtEngine, TileEngine, TransferMode,
};
use tilefuse_core::instance::{load_presets, preset_path, InferenceInstance, Preset};
use tilefuse_core::logging::{self, LogSettings, DEFAULT_LOG_FILTER};
use tilefuse_core::process::{run_tiled_inference, ProgressCallback, RunContext, RunPlan};
use tilefuse_core::raster::Image;
use tilefuse_core::runtime;
use tilefuse_core::tiling::OverlapRatio;

#[derive(Parser)]
#[command(name = "tilefuse", about = "Tiled neural inference for images of any size")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model over an image and write the blended result
    Run(RunArgs),
    /// Load a model and print its tensors and tile shape
    Inspect(InspectArgs),
    /// Print the tile schedule for an image and tile size
    Plan(PlanArgs),
    /// Manage saved parameter presets
    #[command(subcommand)]
    Preset(PresetCommand),
}

#[derive(Args, Default)]
struct InstanceArgs {
    #[arg(short = 'm', long, help = "ONNX model, absolute or relative to models_dir")]
    model: Option<PathBuf>,
    #[arg(long, value_name = "NAME")]
    input_tensor: Option<String>,
    #[arg(long, value_name = "NAME")]
    output_tensor: Option<String>,
    #[arg(long, value_name = "RATIO", help = "Tile overlap in [0, 0.5]")]
    overlap: Option<f32>,
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_name = "BOOL",
        help = "Keep the model's output resolution instead of resampling back (=false to resample)"
    )]
    keep_output_dimension: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    input: PathBuf,
    output: PathBuf,
    #[command(flatten)]
    instance: InstanceArgs,
    #[arg(long, value_name = "NAME", help = "Start from a saved preset")]
    preset: Option<String>,
    #[arg(long, help = "cuda, tensorrt or cpu")]
    backend: Option<String>,
    #[arg(long, help = "iobinding or direct")]
    transfer: Option<String>,
    #[arg(
        long,
        default_value = "8",
        value_parser = PossibleValuesParser::new(["8", "16"])
            .map(|s| if s == "16" { 16u8 } else { 8u8 }),
        help = "Output bits per sample"
    )]
    depth: u8,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(short = 'm', long)]
    model: PathBuf,
    #[arg(long, value_name = "NAME")]
    input_tensor: Option<String>,
    #[arg(long, value_name = "NAME")]
    output_tensor: Option<String>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long)]
    tile_width: usize,
    #[arg(long, help = "Defaults to --tile-width")]
    tile_height: Option<usize>,
    #[arg(long, default_value_t = 1, help = "Model scale factor")]
    scale: usize,
    #[arg(long, value_name = "RATIO")]
    overlap: Option<f32>,
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    keep_output_dimension: Option<bool>,
}

#[derive(Subcommand)]
enum PresetCommand {
    /// Save the given parameters as a named preset
    Save {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[command(flatten)]
        instance: InstanceArgs,
    },
    /// Print a preset as JSON
    Show { name: String },
    /// List saved presets
    List,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let libs = runtime::setup_runtime_libs();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    runtime::log_runtime_lib_status(&libs);
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Run(args) => run_image(args, &config, &resolved_data_dir).await,
        Commands::Inspect(args) => inspect_model(args, &config, &resolved_data_dir),
        Commands::Plan(args) => print_plan(args, &config),
        Commands::Preset(command) => manage_presets(command, &config, &resolved_data_dir),
    }
}

fn init_logging(data_dir: &Path, verbose: u8, log_filter: Option<&str>) {
    let crash_dir = logging::install_crash_reporter(data_dir);
    let filters = LogSettings {
        verbose,
        filter: log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
    }
    .filters();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let log_file = logging::open_log_file(data_dir);
    let (file_layer, file_error) = match log_file {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}");
        return;
    }

    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "File logging unavailable; logging to console only");
    }
    if let Err(error) = crash_dir {
        warn!(error = %format!("{error:#}"), "Crash reports disabled");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Config defaults, then the preset, then explicit flags.
fn resolve_instance(
    config: &AppConfig,
    preset: Option<&Preset>,
    args: &InstanceArgs,
) -> Result<InferenceInstance> {
    let mut instance = InferenceInstance::from_config(&config.inference, PathBuf::new());
    if let Some(preset) = preset {
        instance.assign(&preset.instance);
    }

    if let Some(model) = &args.model {
        instance.model_path = model.clone();
    }
    if let Some(name) = &args.input_tensor {
        instance.input_tensor = name.clone();
    }
    if let Some(name) = &args.output_tensor {
        instance.output_tensor = name.clone();
    }
    if let Some(overlap) = args.overlap {
        instance.tile_overlap = OverlapRatio::new(overlap)?;
    }
    if let Some(keep) = args.keep_output_dimension {
        instance.keep_output_dimension = keep;
    }

    if instance.model_path.as_os_str().is_empty() {
        bail!("no model given: pass --model or a preset that names one");
    }
    Ok(instance)
}

/// Existing paths are used as given; anything else is looked up in models_dir.
fn resolve_model_path(config: &AppConfig, data_dir: &Path, model: &Path) -> PathBuf {
    if model.is_absolute() || model.exists() {
        return model.to_path_buf();
    }
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    models_dir.join(model)
}

fn engine_options(
    config: &AppConfig,
    data_dir: &Path,
    backend: Option<&str>,
    transfer: Option<&str>,
) -> EngineOptions {
    EngineOptions {
        backend: backend
            .map(InferenceBackend::from_str_lossy)
            .unwrap_or(config.inference.backend),
        transfer: transfer
            .map(TransferMode::from_str_lossy)
            .unwrap_or(config.inference.transfer),
        trt_cache_dir: Some(resolve_relative_to(data_dir, &config.paths.trt_cache_dir)),
        ..Default::default()
    }
}

async fn run_image(args: RunArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let presets_dir = resolve_relative_to(data_dir, &config.paths.presets_dir);
    let preset = args
        .preset
        .as_deref()
        .map(|name| preset_path(&presets_dir, name).and_then(|path| Preset::load(&path)))
        .transpose()?;
    let instance = resolve_instance(config, preset.as_ref(), &args.instance)?;
    let model_path = resolve_model_path(config, data_dir, &instance.model_path);
    let options = instance.engine_options(engine_options(
        config,
        data_dir,
        args.backend.as_deref(),
        args.transfer.as_deref(),
    ));
    let params = instance.tile_params();
    let depth = args.depth;
    let (input, output) = (args.input, args.output);

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut engine = OrtEngine::load(&model_path, options)?;
        let image = Image::load(&input)?;
        info!(
            input = %input.display(),
            width = image.width(),
            height = image.height(),
            channels = image.channels(),
            overlap = %params.overlap,
            "Running tiled inference"
        );

        let mut ctx = RunContext::new(worker_cancel).with_progress(make_progress_callback());
        let result = run_tiled_inference(&mut engine, &image, &params, &mut ctx);
        eprintln!();
        let result = result?;

        result.save(&output, depth)?;
        info!(
            output = %output.display(),
            width = result.width(),
            height = result.height(),
            "Wrote output image"
        );
        Ok(())
    });

    tokio::select! {
        joined = &mut worker => joined.context("inference worker panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping after the current tile");
            cancel.cancel();
            worker.await.context("inference worker panicked")?
        }
    }
}

fn inspect_model(args: InspectArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model_path = resolve_model_path(config, data_dir, &args.model);
    let mut options = engine_options(config, data_dir, args.backend.as_deref(), None);
    options.input_tensor = args
        .input_tensor
        .unwrap_or_else(|| config.inference.input_tensor.clone());
    options.output_tensor = args
        .output_tensor
        .unwrap_or_else(|| config.inference.output_tensor.clone());

    let engine = OrtEngine::load(&model_path, options)?;
    println!("model: {}", model_path.display());
    for tensor in engine.tensors() {
        println!(
            "  {:<6} {:<24} {:<8} {:?}",
            tensor.role.to_string(),
            tensor.name,
            tensor.data_type,
            tensor.shape
        );
    }
    println!("tile: {}", engine.shape());
    Ok(())
}

fn print_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    if args.width == 0 || args.height == 0 || args.tile_width == 0 || args.scale == 0 {
        bail!("width, height, tile width and scale must be positive");
    }
    let tile_height = args.tile_height.unwrap_or(args.tile_width);
    let overlap = match args.overlap {
        Some(ratio) => OverlapRatio::new(ratio)?,
        None => config.inference.tile_overlap,
    };
    let shape = EngineShape::new(
        args.tile_width,
        tile_height,
        args.tile_width * args.scale,
        tile_height * args.scale,
    )?;
    let mut params = config.inference.tile_params();
    params.overlap = overlap;
    if let Some(keep) = args.keep_output_dimension {
        params.keep_output_dimension = keep;
    }

    let plan = RunPlan::new(args.width, args.height, &shape, &params);
    println!("image:      {}x{}", args.width, args.height);
    println!("tile:       {shape}");
    println!("overlap:    {overlap}");
    println!(
        "step:       {}x{}",
        plan.schedule.step_x, plan.schedule.step_y
    );
    println!(
        "grid:       {} columns x {} rows = {} tiles",
        plan.schedule.columns(),
        plan.schedule.rows(),
        plan.schedule.len()
    );
    println!("accumulate: {}x{}", plan.accum_w, plan.accum_h);
    println!(
        "output:     {}x{} ({})",
        plan.output_w, plan.output_h, plan.resample
    );
    Ok(())
}

fn manage_presets(command: PresetCommand, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let presets_dir = resolve_relative_to(data_dir, &config.paths.presets_dir);
    match command {
        PresetCommand::Save {
            name,
            description,
            instance,
        } => {
            let path = preset_path(&presets_dir, &name)?;
            let mut preset = Preset::new(name, resolve_instance(config, None, &instance)?);
            preset.description = description;
            preset.save(&path)?;
            info!(path = %path.display(), "Saved preset");
        }
        PresetCommand::Show { name } => {
            let preset = Preset::load(&preset_path(&presets_dir, &name)?)?;
            println!("{}", serde_json::to_string_pretty(&preset)?);
        }
        PresetCommand::List => {
            for (slug, preset) in load_presets(&presets_dir) {
                println!("{slug:<20} {}", preset.description);
            }
        }
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

/// The first tile includes session warm-up and is left out of the rate.
const RATE_WARMUP_TILES: usize = 1;

fn compute_tile_rate(completed: usize, rate_elapsed: f64) -> f64 {
    if rate_elapsed <= 0.0 || completed <= RATE_WARMUP_TILES {
        return 0.0;
    }
    (completed - RATE_WARMUP_TILES) as f64 / rate_elapsed
}

fn format_progress(completed: usize, total: usize, total_elapsed: f64, rate: f64) -> String {
    let fraction = if total > 0 {
        (completed as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if rate > 0.0 {
        let remaining = total.saturating_sub(completed) as f64;
        format!(" | ETA {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | {:.1} tiles/s | Elapsed {}{}",
        bar,
        fraction * 100.0,
        completed,
        total,
        rate,
        format_duration(total_elapsed),
        eta,
    )
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let mut rate_start: Option<Instant> = None;
    Box::new(move |completed, total| {
        if rate_start.is_none() && completed >= RATE_WARMUP_TILES {
            rate_start = Some(Instant::now());
        }
        let rate_elapsed = rate_start
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let rate = compute_tile_rate(completed, rate_elapsed);
        eprint!(
            "\r{}    ",
            format_progress(completed, total, start.elapsed().as_secs_f64(), rate)
        );
    })
}



#[cfg(test)]
mod instance_resolution_tests {
    use super::*;
    use tilefuse_core::engine::DEFAULT_INPUT_TENSOR;

    #[test]
    fn flags_override_preset_and_config() {
        let mut config = AppConfig::default();
        config.inference.output_tensor = "cfg_out".to_string();
        let preset = Preset::new(
            "p",
            InferenceInstance {
                model_path: PathBuf::from("preset.onnx"),
                tile_overlap: OverlapRatio::new(0.1).expect("overlap"),
                ..InferenceInstance::default()
            },
        );
        let args = InstanceArgs {
            overlap: Some(0.3),
            ..Default::default()
        };

        let instance = resolve_instance(&config, Some(&preset), &args).expect("resolve");
        assert_eq!(instance.model_path, PathBuf::from("preset.onnx"));
        assert_eq!(instance.tile_overlap.get(), 0.3);
        assert_eq!(instance.input_tensor, DEFAULT_INPUT_TENSOR);
        // the preset carries its own tensor names
        assert_eq!(instance.output_tensor, "output");
    }

    #[test]
    fn config_tensor_names_apply_without_preset() {
        let mut config = AppConfig::default();
        config.inference.output_tensor = "cfg_out".to_string();
        let args = InstanceArgs {
            model: Some(PathBuf::from("m.onnx")),
            keep_output_dimension: Some(true),
            ..Default::default()
        };

        let instance = resolve_instance(&config, None, &args).expect("resolve");
        assert_eq!(instance.output_tensor, "cfg_out");
        assert!(instance.keep_output_dimension);
    }

    #[test]
    fn flag_turns_off_keep_output_dimension_from_preset_and_config() {
        let mut config = AppConfig::default();
        config.inference.keep_output_dimension = true;
        let preset = Preset::new(
            "keep",
            InferenceInstance {
                model_path: PathBuf::from("x2.onnx"),
                keep_output_dimension: true,
                ..InferenceInstance::default()
            },
        );

        let unset = resolve_instance(&config, Some(&preset), &InstanceArgs::default())
            .expect("resolve");
        assert!(unset.keep_output_dimension);

        let args = InstanceArgs {
            keep_output_dimension: Some(false),
            ..Default::default()
        };
        let instance = resolve_instance(&config, Some(&preset), &args).expect("resolve");
        assert!(!instance.keep_output_dimension);
    }

    #[test]
    fn missing_model_is_an_error() {
        let err = resolve_instance(&AppConfig::default(), None, &InstanceArgs::default())
            .expect_err("no model");
        assert!(err.to_string().contains("no model given"));
    }

    #[test]
    fn out_of_range_overlap_flag_is_rejected() {
        let args = InstanceArgs {
            model: Some(PathBuf::from("m.onnx")),
            overlap: Some(0.9),
            ..Default::default()
        };
        assert!(resolve_instance(&AppConfig::default(), None, &args).is_err());
    }

    #[test]
    fn relative_model_is_looked_up_in_models_dir() {
        let config = AppConfig::default();
        assert_eq!(
            resolve_model_path(&config, Path::new("/data"), Path::new("no-such-x2.onnx")),
            PathBuf::from("/data/models/no-such-x2.onnx")
        );
        assert_eq!(
            resolve_model_path(&config, Path::new("/data"), Path::new("/abs/m.onnx")),
            PathBuf::from("/abs/m.onnx")
        );
    }

    #[test]
    fn backend_and_transfer_flags_override_config() {
        let config = AppConfig::default();
        let options = engine_options(&config, Path::new("/data"), Some("trt"), Some("direct"));
        assert_eq!(options.backend, InferenceBackend::Tensorrt);
        assert_eq!(options.transfer, TransferMode::Direct);
        assert_eq!(options.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));
    }
}
