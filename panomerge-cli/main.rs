//! `panomerge` command-line interface.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use panomerge_cli::{enhance_panorama, io, EnhanceParams, FeatureExtractor, MergeEngine};
use panomerge_core::{
    default_thread_count, init_thread_pool, CancelToken, DetectorKind, MergeConfiguration,
    MergeMode, RasterImage, ResourceLimits, SeamLayout,
};
use panomerge_detect::{tune_preprocessing, DetectorConfig, GrayFrame, PreprocessParams};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "panomerge")]
#[command(about = "Merge overlapping images into panoramas, blends or side-by-side composites")]
#[command(version)]
struct Cli {
    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Fast,
    Quality,
    IlluminationRobust,
}

impl Preset {
    fn config(self) -> DetectorConfig {
        match self {
            Preset::Fast => DetectorConfig::fast_preset(),
            Preset::Quality => DetectorConfig::quality_preset(),
            Preset::IlluminationRobust => DetectorConfig::illumination_robust_preset(),
        }
    }
}

#[derive(clap::Args)]
struct EngineArgs {
    /// JSON or TOML configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// feature_merge, side_by_side or blend
    #[arg(long)]
    mode: Option<MergeMode>,

    /// Ratio-test threshold in (0, 1); lower is stricter
    #[arg(long)]
    threshold: Option<f32>,

    /// Weight of the second image inside the overlap in blend mode
    #[arg(long)]
    alpha: Option<f32>,

    /// scale_invariant or binary
    #[arg(long)]
    detector: Option<DetectorKind>,

    #[arg(long)]
    max_dimension: Option<usize>,

    /// horizontal or vertical side-by-side layout
    #[arg(long)]
    layout: Option<SeamLayout>,

    #[arg(long)]
    seed: Option<u64>,

    /// Detector tuning preset
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Preprocessing parameters written by `tune --params-out` (JSON or TOML)
    #[arg(long)]
    preprocess: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge two or more images.
    Merge {
        /// Input images; the first is the anchor.
        #[arg(required = true, num_args = 2..)]
        images: Vec<PathBuf>,

        /// Output PNG.
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        /// Write the correspondence visualization of the first pair here.
        #[arg(long)]
        matches: Option<PathBuf>,

        /// Write the preprocessed preview of the anchor here.
        #[arg(long)]
        preview: Option<PathBuf>,

        /// Write metadata JSON here instead of stdout.
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Abort the merge after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Draw feature correspondences between two images.
    Matches {
        a: PathBuf,
        b: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Show an image next to its preprocessed luminance.
    Preview {
        image: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Local contrast, sharpening and saturation boost for a finished panorama.
    Enhance {
        image: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Derive preprocessing parameters from a representative image set.
    Tune {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, default_value = "binary")]
        detector: DetectorKind,
        /// Also write the tuned preprocessing parameters here for `--preprocess`.
        #[arg(long)]
        params_out: Option<PathBuf>,
    },
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    init_thread_pool(cli.threads.unwrap_or_else(default_thread_count))?;

    match cli.command {
        Commands::Merge { images, out, engine, matches, preview, metadata, timeout_secs } => {
            run_merge(&images, &out, &engine, matches.as_deref(), preview.as_deref(), metadata.as_deref(), timeout_secs)
        }
        Commands::Matches { a, b, out, engine } => {
            let engine_cfg = build_config(&engine)?;
            let limits = engine_cfg.limits.clone();
            let merger = build_engine(engine_cfg, &engine)?;
            let drawn = merger.visualize_matches(io::load(&a, 0, &limits)?, io::load(&b, 1, &limits)?, &CancelToken::new())?;
            save(&drawn, &out)
        }
        Commands::Preview { image, out, engine } => {
            let engine_cfg = build_config(&engine)?;
            let limits = engine_cfg.limits.clone();
            let merger = build_engine(engine_cfg, &engine)?;
            let preview = merger.preview(io::load(&image, 0, &limits)?, &CancelToken::new())?;
            save(&preview, &out)
        }
        Commands::Enhance { image, out } => {
            let img = io::load(&image, 0, &ResourceLimits::default())?;
            save(&enhance_panorama(&img, &EnhanceParams::default())?, &out)
        }
        Commands::Tune { images, detector, params_out } => run_tune(&images, detector, params_out.as_deref()),
    }
}

fn build_config(args: &EngineArgs) -> CliResult<MergeConfiguration> {
    let mut cfg = match &args.config {
        Some(path) => MergeConfiguration::load(path)?,
        None => MergeConfiguration::default(),
    };
    if let Some(mode) = args.mode {
        cfg = cfg.with_mode(mode);
    }
    if let Some(t) = args.threshold {
        cfg = cfg.with_match_threshold(t);
    }
    if let Some(a) = args.alpha {
        cfg = cfg.with_blend_alpha(a);
    }
    if let Some(d) = args.detector {
        cfg = cfg.with_detector(d);
    }
    if let Some(m) = args.max_dimension {
        cfg = cfg.with_max_dimension(m);
    }
    if let Some(l) = args.layout {
        cfg = cfg.with_layout(l);
    }
    if let Some(s) = args.seed {
        cfg = cfg.with_seed(s);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn build_engine(cfg: MergeConfiguration, args: &EngineArgs) -> CliResult<MergeEngine> {
    if args.preset.is_none() && args.preprocess.is_none() {
        return Ok(MergeEngine::new(cfg)?);
    }
    let preprocess = args.preprocess.as_ref().map(PreprocessParams::load).transpose()?;
    let extractor =
        FeatureExtractor::tuned(cfg.detector, cfg.max_features, args.preset.map(Preset::config), preprocess)?;
    Ok(MergeEngine::with_extractor(cfg, extractor)?)
}

fn run_merge(
    paths: &[PathBuf],
    out: &Path,
    args: &EngineArgs,
    matches_out: Option<&Path>,
    preview_out: Option<&Path>,
    metadata_out: Option<&Path>,
    timeout_secs: Option<u64>,
) -> CliResult<()> {
    let mut cfg = build_config(args)?;
    cfg.diagnostics.match_visualization = matches_out.is_some();
    cfg.diagnostics.preprocessed_preview = preview_out.is_some();
    let engine = build_engine(cfg, args)?;
    let limits = &engine.config().limits;

    let images = paths
        .iter()
        .enumerate()
        .map(|(i, p)| io::load(p, i, limits))
        .collect::<Result<Vec<_>, _>>()?;

    let cancel = timeout_secs.map(|s| CancelToken::with_timeout(Duration::from_secs(s))).unwrap_or_default();
    let t0 = Instant::now();
    let output = engine.merge(images, &cancel)?;
    tracing::info!("Time taken: {:.2?}", t0.elapsed());

    save(&output.image, out)?;
    if let (Some(path), Some(img)) = (matches_out, &output.diagnostics.matches) {
        save(img, path)?;
    }
    if let (Some(path), Some(img)) = (preview_out, &output.diagnostics.preview) {
        save(img, path)?;
    }

    let json = serde_json::to_string_pretty(&output.metadata)?;
    match metadata_out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}

fn run_tune(paths: &[PathBuf], detector: DetectorKind, params_out: Option<&Path>) -> CliResult<()> {
    let limits = ResourceLimits::default();
    let frames = paths
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let img = io::load(p, i, &limits)?;
            let (w, h) = img.dimensions();
            Ok(GrayFrame::new(img.luminance(), w, h))
        })
        .collect::<Result<Vec<_>, panomerge_core::MergeError>>()?;

    let report = tune_preprocessing(&frames, detector, &DetectorConfig::default())?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = params_out {
        report.params.save_json(path)?;
        tracing::info!("Saved preprocessing parameters to {}", path.display());
    }
    Ok(())
}

fn save(img: &RasterImage, path: &Path) -> CliResult<()> {
    io::save_png(img, path)?;
    tracing::info!("Saved {}x{} image to {}", img.width(), img.height(), path.display());
    Ok(())
}
