//! vidarena CLI
//!
//! Reader benchmarking and configuration inspection.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use vidarena::{
    config::references_from_list_file,
    source::{FrameSource, SyntheticSource, SyntheticVideo},
    BatchCapacity, FrameReader, ReaderConfig, VideoReference,
};

/// Nominal frame rate of benchmark videos, used to turn target FPS into a stride
const SOURCE_FPS: u32 = 25;

#[derive(Parser)]
#[command(name = "vidarena")]
#[command(about = "Parallel video-to-frame-batch reader")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration and arena geometry
    Info {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Measure reading speed (samples/s) at several target frame rates
    Bench {
        /// Videos to read; a synthetic corpus is used when none are given
        videos: Vec<String>,

        /// Text file with one path or URL per line
        #[arg(short, long)]
        list: Option<PathBuf>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target frame rates, comma separated
        #[arg(long, value_delimiter = ',', default_value = "1,3,5,10,25")]
        fps: Vec<u32>,

        /// Output frame size
        #[arg(short, long)]
        resize_size: Option<u32>,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Synthetic corpus size
        #[arg(long, default_value = "32")]
        synthetic_videos: usize,

        /// Frames per synthetic video
        #[arg(long, default_value = "250")]
        synthetic_frames: usize,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidarena=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { config } => cmd_info(config),
        Commands::Bench {
            videos,
            list,
            config,
            fps,
            resize_size,
            workers,
            synthetic_videos,
            synthetic_frames,
        } => {
            let mut config = load_config(config)?;
            if let Some(size) = resize_size {
                config = config.with_resize_size(size);
            }
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }

            let mut references: Vec<VideoReference> =
                videos.iter().map(VideoReference::new).collect();
            if let Some(list) = list {
                references.extend(references_from_list_file(list)?);
            }

            cmd_bench(
                config,
                references,
                fps,
                synthetic_videos,
                synthetic_frames,
            )
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ReaderConfig> {
    let config = match path {
        Some(path) => ReaderConfig::load(path)?,
        None => ReaderConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn cmd_info(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(path)?;

    println!("vidarena {}", vidarena::VERSION);
    println!("======================\n");

    println!("=== Reader ===");
    println!("Take every nth: {}", config.take_every_nth);
    println!("Resize size: {}", config.resize_size);
    match config.batch_capacity {
        BatchCapacity::Unbounded => println!("Batch capacity: unbounded"),
        BatchCapacity::Frames(b) => println!("Batch capacity: {} frames", b),
    }
    println!("Workers: {}", config.resolved_workers());
    println!("Auto release: {}", config.auto_release);
    match config.shuffle_seed {
        Some(seed) => println!("Shuffle seed: {}", seed),
        None => println!("Shuffle seed: random"),
    }
    println!();

    println!("=== Arena ===");
    println!(
        "Memory budget: {:.2} GiB",
        config.memory_budget as f64 / (1u64 << 30) as f64
    );
    println!("Row size: {} bytes", config.row_bytes());
    println!("Capacity: {} rows", config.arena_rows());
    println!(
        "Largest unsplit item: {} rows",
        (config.arena_rows() / 4).max(1)
    );
    println!(
        "Put retries: {} x {:?}",
        config.put_retries,
        config.put_backoff()
    );
    println!(
        "Defragment above: {:.0}%",
        config.defrag_high_water * 100.0
    );
    let dir = config
        .segment_dir
        .clone()
        .unwrap_or_else(vidarena::arena::default_segment_dir);
    println!("Segment dir: {}", dir.display());
    println!();

    println!("=== Decoding ===");
    println!(
        "FFmpeg source: {}",
        if cfg!(feature = "ffmpeg") {
            "enabled"
        } else {
            "disabled (build with --features ffmpeg)"
        }
    );

    Ok(())
}

fn bench_source(
    references: &mut Vec<VideoReference>,
    videos: usize,
    frames: usize,
) -> anyhow::Result<Arc<dyn FrameSource>> {
    if references.is_empty() {
        let mut source = SyntheticSource::new();
        for i in 0..videos {
            let name = format!("synthetic/{i:04}.mp4");
            source.insert(name.clone(), SyntheticVideo::new(frames, 640, 360));
            references.push(VideoReference::new(name));
        }
        return Ok(Arc::new(source));
    }
    ffmpeg_source()
}

#[cfg(feature = "ffmpeg")]
fn ffmpeg_source() -> anyhow::Result<Arc<dyn FrameSource>> {
    Ok(Arc::new(vidarena::source::FfmpegSource::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn ffmpeg_source() -> anyhow::Result<Arc<dyn FrameSource>> {
    anyhow::bail!("reading real videos requires building with --features ffmpeg")
}

fn cmd_bench(
    config: ReaderConfig,
    mut references: Vec<VideoReference>,
    fps: Vec<u32>,
    synthetic_videos: usize,
    synthetic_frames: usize,
) -> anyhow::Result<()> {
    println!("vidarena Reader Benchmark");
    println!("=========================\n");

    let source = bench_source(&mut references, synthetic_videos, synthetic_frames)?;

    println!("Videos: {} ({})", references.len(), source.name());
    println!("Resize size: {}", config.resize_size);
    println!("Workers: {}", config.resolved_workers());
    println!();

    let mut results = Vec::with_capacity(fps.len());
    for target in fps {
        let take_every_nth = (SOURCE_FPS / target.max(1)).max(1) as usize;
        let reader_config = config.clone().with_take_every_nth(take_every_nth);
        let reader = FrameReader::new(references.clone(), reader_config, Arc::clone(&source))?;

        let start = Instant::now();
        let mut samples = 0usize;
        for batch in reader {
            samples += batch?.real_frames();
        }
        let elapsed = start.elapsed().as_secs_f64();
        let rate = samples as f64 / elapsed;

        println!("samples/s @ {} FPS = {:.1}", target, rate);
        results.push((target, samples, elapsed, rate));
    }

    println!("\nResults:");
    println!("  {:>6}  {:>10}  {:>9}  {:>10}", "FPS", "samples", "time (s)", "samples/s");
    for (target, samples, elapsed, rate) in results {
        println!(
            "  {:>6}  {:>10}  {:>9.2}  {:>10.1}",
            target, samples, elapsed, rate
        );
    }

    Ok(())
}
