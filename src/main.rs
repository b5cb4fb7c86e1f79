use std::{
    io::{self, BufRead},
    num::NonZeroU32,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, after, bounded, never, select, tick};

use hand_features::{
    CaptureConfig, FeatureMessage, FeatureTransport, JsonLinesTransport, SessionState,
    TrackerConfig, TrackingSession,
    model_download::ModelPaths,
    pipeline::{NokhwaCameraProvider, OrtLandmarkerFactory, available_cameras, load_still_image},
    scheduler::IntervalDriver,
};

/// Tracks hands and prints their distance features as JSON lines.
#[derive(Parser)]
#[command(name = "hand-features", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    models: ModelArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Handpose estimator ONNX file (downloaded when missing)
    #[arg(long, global = true)]
    handpose_model: Option<PathBuf>,

    /// Palm detector ONNX file (downloaded when missing)
    #[arg(long, global = true)]
    palm_model: Option<PathBuf>,
}

impl ModelArgs {
    fn paths(&self) -> ModelPaths {
        let defaults = ModelPaths::default();
        ModelPaths {
            handpose: self.handpose_model.clone().unwrap_or(defaults.handpose),
            palm_detector: self.palm_model.clone().unwrap_or(defaults.palm_detector),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Track hands on a camera until Enter is pressed
    Stream(StreamArgs),

    /// Extract features from one still image
    Image {
        /// Image file (PNG or JPEG)
        path: PathBuf,
    },

    /// List cameras that can be passed to `stream --camera`
    Cameras,
}

#[derive(Args)]
struct StreamArgs {
    /// Camera index
    #[arg(long, default_value_t = 0)]
    camera: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Process one out of every N distinct frames
    #[arg(long, default_value_t = hand_features::config::DEFAULT_FRAME_SKIP_INTERVAL)]
    frame_skip: NonZeroU32,

    /// Release the landmark model when the stream stops
    #[arg(long)]
    release_on_stop: bool,

    /// Stop automatically after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,
}

impl StreamArgs {
    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            capture: CaptureConfig {
                camera_index: self.camera,
                width: self.width,
                height: self.height,
                frame_rate: self.fps,
            },
            ..TrackerConfig::default()
        }
        .with_frame_skip_interval(self.frame_skip)
        .with_release_model_on_stop(self.release_on_stop)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let factory = OrtLandmarkerFactory::new(cli.models.paths());

    match cli.command {
        Command::Stream(args) => run_stream(factory, &args),
        Command::Image { path } => run_image(factory, &path),
        Command::Cameras => list_cameras(),
    }
}

fn run_stream(factory: OrtLandmarkerFactory, args: &StreamArgs) -> Result<()> {
    let config = args.tracker_config();
    let driver = IntervalDriver::new(config.tick_interval);
    let mut session = TrackingSession::new(factory, NokhwaCameraProvider, config);

    let mut transport = JsonLinesTransport::new(io::stdout());
    session
        .start(driver, move |output| {
            let Some(message) = FeatureMessage::from_output(output) else {
                return;
            };
            if let Err(err) = transport.send(&message) {
                log::warn!("failed to forward features: {err:#}");
            }
        })
        .context("failed to start tracking")?;

    let (enter_tx, enter_rx) = bounded(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = enter_tx.send(());
    });
    let deadline = match args.duration_secs {
        Some(secs) => after(Duration::from_secs(secs)),
        None => never(),
    };
    log::info!("tracking; press Enter to stop");
    match wait_for_stop(&enter_rx, &deadline, LOOP_POLL, || {
        session.state() == SessionState::Stopped
    }) {
        StopReason::Requested => log::info!("stop requested"),
        StopReason::Deadline => log::info!("duration elapsed"),
        StopReason::LoopEnded => log::warn!("tracking loop ended on its own"),
    }

    session.stop();
    if let Some(err) = session.take_failure() {
        return Err(err).context("tracking loop failed");
    }
    Ok(())
}

/// How often `stream` checks whether the loop died on its own.
const LOOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq)]
enum StopReason {
    Requested,
    Deadline,
    LoopEnded,
}

fn wait_for_stop(
    enter: &Receiver<()>,
    deadline: &Receiver<Instant>,
    poll: Duration,
    loop_ended: impl Fn() -> bool,
) -> StopReason {
    let ticker = tick(poll);
    loop {
        select! {
            recv(enter) -> _ => return StopReason::Requested,
            recv(deadline) -> _ => return StopReason::Deadline,
            recv(ticker) -> _ => {
                if loop_ended() {
                    return StopReason::LoopEnded;
                }
            }
        }
    }
}

fn run_image(factory: OrtLandmarkerFactory, path: &Path) -> Result<()> {
    let frame = load_still_image(path)?;
    let mut session = TrackingSession::new(factory, NokhwaCameraProvider, TrackerConfig::default());

    let Some(output) = session.detect_single_image(&frame)? else {
        log::info!("no hand detected in {}", path.display());
        return Ok(());
    };
    if let Some(message) = FeatureMessage::from_output(&output) {
        JsonLinesTransport::new(io::stdout()).send(&message)?;
    }
    Ok(())
}

fn list_cameras() -> Result<()> {
    let cameras = available_cameras().context("failed to query cameras")?;
    if cameras.is_empty() {
        println!("no cameras found");
    }
    for camera in cameras {
        println!("{}: {}", camera.index, camera.label);
    }
    Ok(())
}
