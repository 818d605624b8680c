//! camgrab: capture stills from a live video device.
//!
//! ```text
//! camgrab devices
//! camgrab formats --device 0
//! camgrab grab --device 0 --width 640 --height 480 --count 5 --out shots/
//! ```
//!
//! `--backend native` is DirectShow on Windows and GStreamer elsewhere (when
//! built with `--features gstreamer`); `--backend synthetic` streams a test
//! pattern on any platform.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use camgrab_capture::negotiate::nearest_resolution;
use camgrab_capture::{CaptureSession, DeviceEnumerator, DeviceHandle, FrameDelivery, MediaBackend};
use camgrab_core::{CaptureConfig, CaptureError, DeliveryMode, Resolution, Rotation};
use clap::{Parser, Subcommand, ValueEnum};
use image::RgbImage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Give up when no frame arrives for this long.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "camgrab")]
#[command(author, version, about = "List capture devices and grab frames", long_about = None)]
struct Cli {
    /// Media backend
    #[arg(long, value_enum, default_value = "native", global = true)]
    backend: BackendKind,

    /// Capture configuration (JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Native,
    Synthetic,
}

#[derive(Subcommand)]
enum Command {
    /// List capture devices
    Devices,

    /// List the resolutions a device offers
    Formats {
        /// Device index (default: from config, else 0)
        #[arg(short, long)]
        device: Option<usize>,
    },

    /// Capture frames to PNG files
    Grab {
        #[arg(short, long)]
        device: Option<usize>,

        #[arg(long, requires = "height")]
        width: Option<u32>,

        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// none, 90, 180, 270, flip-x, flip-y, cw90-flip-x, cw270-flip-x
        #[arg(short, long)]
        rotation: Option<Rotation>,

        /// Number of frames to save
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Minimum time between saved frames
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Use callback delivery instead of polling snapshots
        #[arg(long)]
        push: bool,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CaptureConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CaptureConfig::default(),
    };

    let result = match cli.backend {
        BackendKind::Synthetic => {
            run_with(camgrab_capture::backend::synthetic::SyntheticBackend::default(), &cli.command, config)
        }
        BackendKind::Native => run_native(&cli.command, config),
    };
    if let Err(e) = &result {
        error!("camgrab failed: {:#}", e);
    }
    result
}

#[cfg(windows)]
fn run_native(command: &Command, config: CaptureConfig) -> Result<()> {
    run_with(camgrab_capture::backend::directshow::DirectShowBackend::new(), command, config)
}

#[cfg(all(not(windows), feature = "gstreamer"))]
fn run_native(command: &Command, config: CaptureConfig) -> Result<()> {
    run_with(camgrab_capture::backend::gst::GstBackend::new()?, command, config)
}

#[cfg(all(not(windows), not(feature = "gstreamer")))]
fn run_native(_command: &Command, _config: CaptureConfig) -> Result<()> {
    bail!("no native backend in this build: rebuild with `--features gstreamer` or pass `--backend synthetic`")
}

fn run_with<B: MediaBackend>(backend: B, command: &Command, mut config: CaptureConfig) -> Result<()> {
    let enumerator = DeviceEnumerator::new(backend)?;
    info!("camgrab v{} ({} backend)", env!("CARGO_PKG_VERSION"), enumerator.backend().name());

    match command {
        Command::Devices => {
            if enumerator.devices().is_empty() {
                println!("No capture devices found");
            }
            for (index, device) in enumerator.devices().iter().enumerate() {
                println!("[{index}] {}  ({})", device.name(), device.path());
            }
            Ok(())
        }

        Command::Formats { device } => {
            let handle = pick_device(&enumerator, *device, &config)?;
            let mut session = CaptureSession::new(Arc::clone(enumerator.backend()));
            session.open(handle.clone())?;
            let resolutions = session.list_resolutions()?;
            println!("{}: {} resolution(s)", handle.name(), resolutions.len());
            for resolution in &resolutions {
                println!("  {resolution}");
            }
            Ok(())
        }

        Command::Grab { device, width, height, rotation, count, interval_ms, push, out } => {
            if let (Some(width), Some(height)) = (width, height) {
                config.resolution = Some(Resolution::new(*width, *height));
            }
            if let Some(rotation) = rotation {
                config.rotation = *rotation;
            }
            if let Some(interval_ms) = interval_ms {
                config.interval_ms = *interval_ms;
            }
            if *push {
                config.mode = DeliveryMode::Push;
            }
            config.validate()?;

            let handle = pick_device(&enumerator, *device, &config)?;
            std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

            let mut session = CaptureSession::new(Arc::clone(enumerator.backend()));
            session.open(handle)?;
            grab(&mut session, config, *count, out)
        }
    }
}

fn pick_device<B: MediaBackend>(
    enumerator: &DeviceEnumerator<B>,
    index: Option<usize>,
    config: &CaptureConfig,
) -> Result<DeviceHandle<B::Device>> {
    if let Some(index) = index {
        return Ok(enumerator.device(index)?);
    }
    if let Some(name) = &config.device_name {
        return enumerator
            .find(name)
            .with_context(|| format!("no capture device named '{name}'"));
    }
    Ok(enumerator.device(config.device_index)?)
}

fn grab<B: MediaBackend>(
    session: &mut CaptureSession<B>,
    mut config: CaptureConfig,
    count: u32,
    out: &Path,
) -> Result<()> {
    if let Some(wanted) = config.resolution {
        let offered = session.list_resolutions()?;
        if !offered.contains(&wanted) {
            match nearest_resolution(&offered, wanted) {
                Some(nearest) => {
                    warn!("{} not offered; using {}", wanted, nearest);
                    config.resolution = Some(nearest);
                }
                None => bail!("device offers no 16/24/32 bpp formats"),
            }
        }
    }
    session.apply_config(&config)?;

    let interval = Duration::from_millis(config.interval_ms);
    let saved = match config.mode {
        DeliveryMode::Push => {
            let (tx, rx) = mpsc::channel::<RgbImage>();
            let resolution = session.build_graph(
                FrameDelivery::push(move |image| {
                    // receiver gone: the grab loop has finished
                    let _ = tx.send(image);
                }),
                config.rotation,
            )?;
            info!("Grabbing {} frame(s) at {} (push)", count, saved_size(resolution, config.rotation));
            session.run()?;

            let mut saved = 0;
            let mut last: Option<Instant> = None;
            while saved < count {
                let image = rx
                    .recv_timeout(FRAME_TIMEOUT)
                    .context("no frame delivered within timeout")?;
                if last.is_some_and(|t| t.elapsed() < interval) {
                    continue;
                }
                last = Some(Instant::now());
                save(&image, out, saved)?;
                saved += 1;
            }
            saved
        }
        DeliveryMode::Pull => {
            let resolution = session.build_graph(FrameDelivery::Pull, Rotation::None)?;
            info!("Grabbing {} frame(s) at {} (pull)", count, saved_size(resolution, config.rotation));
            session.run()?;

            let mut saved = 0;
            let mut waiting_since = Instant::now();
            while saved < count {
                std::thread::sleep(interval);
                match session.snapshot_next_frame(config.rotation) {
                    Ok(image) => {
                        save(&image, out, saved)?;
                        saved += 1;
                        waiting_since = Instant::now();
                    }
                    Err(CaptureError::NoFrameAvailable) if waiting_since.elapsed() < FRAME_TIMEOUT => {}
                    Err(CaptureError::NoFrameAvailable) => bail!("no frame delivered within timeout"),
                    Err(e) => return Err(e.into()),
                }
            }
            saved
        }
    };

    session.stop()?;
    if let Some(stats) = session.stats() {
        info!("Saved {} frame(s); sampler saw {} delivered, {} dropped", saved, stats.delivered, stats.dropped);
    }
    session.close();
    Ok(())
}

/// Size of the saved images once `rotation` is applied.
fn saved_size(captured: Resolution, rotation: Rotation) -> Resolution {
    if rotation.swaps_axes() {
        Resolution::new(captured.height, captured.width)
    } else {
        captured
    }
}

fn save(image: &RgbImage, dir: &Path, n: u32) -> Result<()> {
    let path = dir.join(format!("frame-{n:04}.png"));
    image.save(&path).with_context(|| format!("writing {}", path.display()))?;
    println!("{} ({}x{})", path.display(), image.width(), image.height());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_turns_swap_saved_size() {
        assert_eq!(saved_size(Resolution::VGA, Rotation::Cw90), Resolution::new(480, 640));
        assert_eq!(saved_size(Resolution::VGA, Rotation::Cw270FlipX), Resolution::new(480, 640));
        assert_eq!(saved_size(Resolution::VGA, Rotation::FlipY), Resolution::VGA);
    }

    #[test]
    fn grab_flags_parse() {
        let cli = Cli::try_parse_from([
            "camgrab", "--backend", "synthetic", "grab", "--width", "1280", "--height", "720",
            "--rotation", "90", "-n", "3", "--push",
        ])
        .unwrap();
        assert!(matches!(cli.backend, BackendKind::Synthetic));
        let Command::Grab { width, height, rotation, count, push, .. } = cli.command else {
            panic!("expected grab");
        };
        assert_eq!((width, height), (Some(1280), Some(720)));
        assert_eq!(rotation, Some(Rotation::Cw90));
        assert_eq!(count, 3);
        assert!(push);
    }
}
