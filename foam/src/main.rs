use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use foam_lib::config::EvalConfig;
use foam_lib::device::Device;
use foam_lib::eval::Evaluator;
use foam_lib::replay::{ReplayDataset, ReplayModel};
use foam_lib::{load_scene, pack, pack_async, unpack, unpack_async, DataHandler, SceneRecord};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "foam",
    version = "0.1.0",
    author = "Denis Avvakumov",
    about = "Inspects, packs and evaluates radiance foam scenes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the held-out split and report PSNR.
    Eval {
        #[arg(
            short = 'c',
            long = "config",
            value_name = "CONFIG",
            help = "Path to the config.json stored in the checkpoint directory."
        )]
        config: PathBuf,
    },
    /// Decode a scene and print its size and connectivity.
    Inspect {
        #[arg(value_name = "SCENE", help = "Path to a .ply or packed .ply.zst scene.")]
        scene: PathBuf,
    },
    /// Validate a scene and compress it with zstd.
    Pack(PackArgs),
    /// Decompress a packed scene back to PLY.
    Unpack(UnpackArgs),
}

#[derive(Args, Debug)]
struct PackArgs {
    #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the input file.")]
    input: PathBuf,

    #[arg(short = 'o', long = "output", value_name = "OUTPUT", help = "Path to the output file.")]
    output: PathBuf,

    #[arg(
        short = 'c',
        long = "compression-level",
        value_name = "LEVEL",
        default_value = "3",
        help = "Set the compression level."
    )]
    compression_level: u32,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Set the workers count for ZSTD."
    )]
    workers: u32,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous compression mode."
    )]
    async_mode: bool,
}

#[derive(Args, Debug)]
struct UnpackArgs {
    #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the input file.")]
    input: PathBuf,

    #[arg(short = 'o', long = "output", value_name = "OUTPUT", help = "Path to the output file.")]
    output: PathBuf,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous decompression mode."
    )]
    async_mode: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Eval { config } => run_eval(&config),
        Command::Inspect { scene } => run_inspect(&scene),
        Command::Pack(args) => run_pack(&args),
        Command::Unpack(args) => run_unpack(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run_eval(config_path: &Path) -> Result<()> {
    let config = EvalConfig::load(config_path)?;
    let checkpoint = EvalConfig::checkpoint_dir(config_path);
    let device = Device::parse(&config.device)?;
    let split = config.split()?;
    let downsample = config.eval_downsample()?;
    info!(
        "Evaluating {} on the {} split (downsample {}, device {})",
        checkpoint.display(),
        split.label(),
        downsample,
        device
    );

    let scene_path = checkpoint.join(&config.scene_file);
    let scene = load_scene(&scene_path)
        .with_context(|| format!("failed to load scene {}", scene_path.display()))?;

    let mut dataset = ReplayDataset::new(config.resolve_data_dir(&checkpoint));
    let data = dataset
        .reload(split, downsample)
        .with_context(|| format!("failed to load the {} split", split.label()))?;

    let cache = ReplayModel::render_cache_path(&checkpoint, split);
    let model = ReplayModel::load(scene, &cache, downsample)
        .with_context(|| format!("failed to load render cache {}", cache.display()))?;

    let start = Instant::now();
    let report = Evaluator::from_config(&checkpoint, &config).run(&model, &data)?;
    info!(
        "Average PSNR: {:.3} over {} images in {} ms",
        report.average_psnr,
        report.per_image_psnr.len(),
        start.elapsed().as_millis()
    );
    Ok(())
}

fn run_inspect(path: &Path) -> Result<()> {
    let scene = load_scene(path)?;
    let (min_degree, max_degree, mean_degree) = degree_stats(&scene);
    info!(
        "Points: {} | Edges: {} | Higher SH coefficients: {}",
        scene.num_points,
        scene.num_edges(),
        scene.higher_dim
    );
    info!(
        "Degree: min {} | max {} | mean {:.2}",
        min_degree, max_degree, mean_degree
    );
    Ok(())
}

fn degree_stats(scene: &SceneRecord) -> (u32, u32, f64) {
    if scene.num_points == 0 {
        return (0, 0, 0.0);
    }
    let degrees = scene.offsets.windows(2).map(|w| w[1] - w[0]);
    let min = degrees.clone().min().unwrap_or(0);
    let max = degrees.max().unwrap_or(0);
    (min, max, scene.num_edges() as f64 / scene.num_points as f64)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

fn run_pack(args: &PackArgs) -> Result<()> {
    let raw_data = fs::read(&args.input)
        .with_context(|| format!("failed to read input file {}", args.input.display()))?;
    info!(
        "Mode: {} packing | Input: {} | Output: {} | Level: {}",
        mode_label(args.async_mode),
        args.input.display(),
        args.output.display(),
        args.compression_level
    );

    let start = Instant::now();
    let mut buf = Vec::new();
    if args.async_mode {
        runtime()?.block_on(pack_async(
            &raw_data,
            args.compression_level,
            args.workers,
            &mut buf,
        ))?;
    } else {
        pack(&raw_data, args.compression_level, args.workers, &mut buf)?;
    }
    info!("Packing Time: {} ms", start.elapsed().as_millis());

    write_output(&args.output, &buf)
}

fn run_unpack(args: &UnpackArgs) -> Result<()> {
    let packed = fs::read(&args.input)
        .with_context(|| format!("failed to read input file {}", args.input.display()))?;
    info!(
        "Mode: {} unpacking | Input: {} | Output: {}",
        mode_label(args.async_mode),
        args.input.display(),
        args.output.display()
    );

    let start = Instant::now();
    let mut buf = Vec::new();
    if args.async_mode {
        runtime()?.block_on(unpack_async(&packed, &mut buf))?;
    } else {
        unpack(&packed, &mut buf)?;
    }
    info!("Unpacking Time: {} ms", start.elapsed().as_millis());

    write_output(&args.output, &buf)
}

fn mode_label(async_mode: bool) -> &'static str {
    if async_mode {
        "Asynchronous"
    } else {
        "Synchronous"
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(anyhow!("refusing to write an empty output"));
    }
    fs::write(path, data).with_context(|| format!("failed to write output {}", path.display()))?;
    info!("Successfully wrote {} bytes to '{}'.", data.len(), path.display());
    Ok(())
}
