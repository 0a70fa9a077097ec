use std::{
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use image::GenericImageView as _;

use framepipe::{
    FnTransform, FrameIndex, FrameSink, FrameSource, FramepipeError, FramepipeResult, Pipeline,
    PipelineOpts, WorkerCommand, run_worker_stdio,
};

#[derive(Parser, Debug)]
#[command(name = "framepipe", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a directory of image frames in parallel, preserving order.
    Run(RunArgs),
    /// Internal: stdio worker loop for the process substrate.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Input directory of image frames (processed in file-name order).
    #[arg(long = "in")]
    in_dir: PathBuf,

    /// Output directory; frames are written as `frame_NNNNN.png` by index.
    #[arg(long)]
    out: PathBuf,

    /// Number of parallel workers.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Worker execution substrate.
    #[arg(long, value_enum, default_value_t = SubstrateChoice::Thread)]
    substrate: SubstrateChoice,

    /// Pixel transform to apply.
    #[arg(long, value_enum, default_value_t = TransformChoice::Invert)]
    transform: TransformChoice,

    /// Dispatch queue capacity.
    #[arg(long, default_value_t = 8)]
    dispatch_cap: usize,

    /// Result queue capacity.
    #[arg(long, default_value_t = 8)]
    result_cap: usize,

    /// Cancellation poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Pixel transform to apply.
    #[arg(long, value_enum)]
    transform: TransformChoice,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SubstrateChoice {
    Thread,
    Process,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransformChoice {
    Invert,
    Grayscale,
    Pixelate,
}

impl TransformChoice {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Invert => "invert",
            Self::Grayscale => "grayscale",
            Self::Pixelate => "pixelate",
        }
    }
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().cmd {
        Command::Run(args) => cmd_run(args),
        Command::Worker(args) => cmd_worker(args),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let opts = PipelineOpts {
        worker_count: args.workers,
        dispatch_capacity: args.dispatch_cap,
        result_capacity: args.result_cap,
        poll_interval: Duration::from_millis(args.poll_ms),
        max_frames: args.max_frames,
    };
    let pipeline = Pipeline::new(opts)?;

    let token = pipeline.cancel_token();
    ctrlc::set_handler(move || token.cancel()).context("install Ctrl-C handler")?;

    let mut source = ImageDirSource::scan(&args.in_dir)?;
    let mut sink = ImageDirSink {
        dir: args.out.clone(),
    };

    let choice = args.transform;
    let started = Instant::now();
    let stats = match args.substrate {
        SubstrateChoice::Thread => pipeline.run(
            &mut source,
            || Ok(FnTransform::new(move |frame: Vec<u8>| apply_pixels(choice, frame))),
            &mut sink,
        )?,
        SubstrateChoice::Process => {
            let worker =
                WorkerCommand::current_exe()?.args(["worker", "--transform", choice.as_arg()]);
            pipeline.run_process(&mut source, &worker, &mut sink)?
        }
    };
    let elapsed = started.elapsed().as_secs_f64();

    if stats.completed {
        eprintln!(
            "processed {} frames in {elapsed:.2}s ({} failed, peak reorder depth {})",
            stats.frames_emitted, stats.frames_failed, stats.max_reorder_depth
        );
    } else {
        eprintln!(
            "interrupted after {elapsed:.2}s: {} emitted, {} failed, {} discarded",
            stats.frames_emitted, stats.frames_failed, stats.frames_discarded
        );
    }
    for FrameIndex(idx) in &stats.failed_frames {
        eprintln!("frame {idx} failed and was skipped");
    }
    Ok(())
}

fn cmd_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let choice = args.transform;
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_worker_stdio(
        FnTransform::new(move |frame: Vec<u8>| apply_pixels(choice, frame)),
        stdin.lock(),
        stdout.lock(),
    )?;
    Ok(())
}

/// Decode, transform and re-encode one frame. Used by both substrates so a
/// threaded run and a process run produce identical output.
fn apply_pixels(choice: TransformChoice, bytes: Vec<u8>) -> FramepipeResult<Vec<u8>> {
    let img = image::load_from_memory(&bytes)
        .map_err(|e| FramepipeError::transform(format!("decode frame: {e}")))?;

    let out = match choice {
        TransformChoice::Invert => {
            let mut img = img;
            img.invert();
            img
        }
        TransformChoice::Grayscale => img.grayscale(),
        TransformChoice::Pixelate => {
            let (w, h) = img.dimensions();
            img.resize_exact(
                (w / 8).max(1),
                (h / 8).max(1),
                image::imageops::FilterType::Nearest,
            )
            .resize_exact(w, h, image::imageops::FilterType::Nearest)
        }
    };

    let mut encoded = Cursor::new(Vec::new());
    out.write_to(&mut encoded, image::ImageFormat::Png)
        .map_err(|e| FramepipeError::transform(format!("encode frame: {e}")))?;
    Ok(encoded.into_inner())
}

struct ImageDirSource {
    frames: Vec<PathBuf>,
    cursor: usize,
}

impl ImageDirSource {
    fn scan(dir: &Path) -> anyhow::Result<Self> {
        let entries =
            fs::read_dir(dir).with_context(|| format!("read input dir '{}'", dir.display()))?;
        let mut frames = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_frame = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    matches!(
                        ext.to_ascii_lowercase().as_str(),
                        "png" | "jpg" | "jpeg" | "bmp"
                    )
                });
            if is_frame {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(Self { frames, cursor: 0 })
    }
}

impl FrameSource<Vec<u8>> for ImageDirSource {
    fn open(&mut self) -> FramepipeResult<()> {
        if self.frames.is_empty() {
            return Err(FramepipeError::source("no image frames in input directory"));
        }
        Ok(())
    }

    fn next_frame(&mut self) -> FramepipeResult<Option<Vec<u8>>> {
        let Some(path) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let bytes = fs::read(path)
            .map_err(|e| FramepipeError::source(format!("read frame '{}': {e}", path.display())))?;
        Ok(Some(bytes))
    }

    fn close(&mut self) -> FramepipeResult<()> {
        Ok(())
    }
}

struct ImageDirSink {
    dir: PathBuf,
}

impl FrameSink<Vec<u8>> for ImageDirSink {
    fn begin(&mut self) -> FramepipeResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            FramepipeError::sink(format!("create output dir '{}': {e}", self.dir.display()))
        })
    }

    fn push_frame(&mut self, idx: FrameIndex, frame: Vec<u8>) -> FramepipeResult<()> {
        let path = self.dir.join(format!("frame_{:05}.png", idx.0));
        fs::write(&path, frame)
            .map_err(|e| FramepipeError::sink(format!("write frame '{}': {e}", path.display())))
    }

    fn end(&mut self) -> FramepipeResult<()> {
        Ok(())
    }
}
