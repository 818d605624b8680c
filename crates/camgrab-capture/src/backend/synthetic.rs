//! In-process test-pattern source.
//!
//! Behaves like a capture card: a capability table, an optional input router
//! and a delivery thread that pushes 24 bpp bottom-up BGR frames into the
//! sampler at the device frame rate. Routing the `Black` connector renders
//! black frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camgrab_core::{ColorSubtype, ConnectorType, FormatCapability, SampleFormat};
use tracing::{debug, info};

use crate::device::{DeviceHandle, MediaBackend};
use crate::graph::NativeGraph;
use crate::negotiate::FormatSource;
use crate::sampler::FrameSampler;

/// 75% colour bars, left to right, as B,G,R.
const BARS: [[u8; 3]; 8] = [
    [191, 191, 191],
    [0, 191, 191],
    [191, 191, 0],
    [0, 191, 0],
    [191, 0, 191],
    [0, 0, 191],
    [191, 0, 0],
    [0, 0, 0],
];

#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    pub name: String,
    pub capabilities: Vec<FormatCapability>,
    /// Router inputs in pin order; `None` for a device without a router.
    pub inputs: Option<Vec<ConnectorType>>,
    pub fps: u32,
}

impl SyntheticDevice {
    /// "Test Pattern": VGA YUY2 and RGB24, 720p RGB24, QVGA RGB32, behind a
    /// composite / S-Video router, 30 fps.
    pub fn test_pattern() -> Self {
        let caps = [
            (640, 480, 16, ColorSubtype::Yuy2),
            (640, 480, 24, ColorSubtype::Rgb24),
            (1280, 720, 24, ColorSubtype::Rgb24),
            (320, 240, 32, ColorSubtype::Rgb32),
        ];
        Self {
            name: "Test Pattern".into(),
            capabilities: caps
                .into_iter()
                .enumerate()
                .map(|(index, (width, height, bits_per_pixel, subtype))| FormatCapability {
                    width,
                    height,
                    bits_per_pixel,
                    subtype,
                    index,
                })
                .collect(),
            inputs: Some(vec![ConnectorType::Composite, ConnectorType::SVideo]),
            fps: 30,
        }
    }
}

pub struct SyntheticBackend {
    devices: Vec<SyntheticDevice>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<SyntheticDevice>) -> Self {
        Self { devices }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(vec![SyntheticDevice::test_pattern()])
    }
}

impl MediaBackend for SyntheticBackend {
    type Device = SyntheticDevice;
    type Graph = SyntheticGraph;

    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle<SyntheticDevice>>> {
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| DeviceHandle::new(d.name.clone(), format!("synthetic://{i}"), d.clone()))
            .collect())
    }

    fn create_graph(&self) -> Result<SyntheticGraph> {
        Ok(SyntheticGraph::default())
    }
}

// ── SyntheticGraph ─────────────────────────────────────────────────────────────

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct SyntheticGraph {
    device: Option<SyntheticDevice>,
    committed: Option<FormatCapability>,
    routed: Option<ConnectorType>,
    sampler: Option<Arc<FrameSampler>>,
    format: Option<SampleFormat>,
    worker: Option<Worker>,
}

impl SyntheticGraph {
    fn source(&self) -> Result<&SyntheticDevice> {
        self.device.as_ref().context("no source in graph")
    }
}

impl FormatSource for SyntheticGraph {
    fn capability_count(&self) -> Result<usize> {
        Ok(self.source()?.capabilities.len())
    }

    fn capability(&self, index: usize) -> Result<FormatCapability> {
        let caps = &self.source()?.capabilities;
        let cap = caps
            .get(index)
            .with_context(|| format!("capability {index} out of range ({} reported)", caps.len()))?;
        Ok(FormatCapability { index, ..*cap })
    }

    fn apply_format(&mut self, capability: &FormatCapability) -> Result<()> {
        let device = self.source()?;
        if !device.capabilities.iter().any(|c| c.resolution() == capability.resolution()) {
            bail!("{} not offered by '{}'", capability, device.name);
        }
        self.committed = Some(*capability);
        Ok(())
    }
}

impl NativeGraph for SyntheticGraph {
    type Device = SyntheticDevice;

    fn add_source(&mut self, device: &SyntheticDevice) -> Result<()> {
        if device.fps == 0 {
            bail!("'{}' reports a zero frame rate", device.name);
        }
        self.device = Some(device.clone());
        Ok(())
    }

    fn router_inputs(&mut self) -> Result<Option<Vec<ConnectorType>>> {
        Ok(self.source()?.inputs.clone())
    }

    fn route(&mut self, input: usize) -> Result<()> {
        let connector = self
            .source()?
            .inputs
            .as_ref()
            .and_then(|inputs| inputs.get(input).copied())
            .with_context(|| format!("router has no input {input}"))?;
        self.routed = Some(connector);
        Ok(())
    }

    fn add_sampler(&mut self, sampler: Arc<FrameSampler>) -> Result<()> {
        self.sampler = Some(sampler);
        Ok(())
    }

    fn connect(&mut self) -> Result<SampleFormat> {
        let cap = self.committed.context("source format not set")?;
        if self.sampler.is_none() {
            bail!("no sampler to connect to");
        }
        let format = SampleFormat { bottom_up: true, ..SampleFormat::new(cap.width, cap.height, 24) };
        self.format = Some(format);
        Ok(format)
    }

    fn run(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let format = self.format.context("graph not connected")?;
        let sampler = Arc::clone(self.sampler.as_ref().context("graph not connected")?);
        let fps = self.source()?.fps;
        let black = self.routed == Some(ConnectorType::Black);

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                let interval = Duration::from_secs(1) / fps;
                let mut frame = 0u64;
                while flag.load(Ordering::Relaxed) {
                    let data = if black {
                        vec![0u8; format.frame_len().unwrap_or(0)]
                    } else {
                        render_bars(format.width, format.height, frame)
                    };
                    sampler.deliver(&data);
                    frame += 1;
                    std::thread::sleep(interval);
                }
                debug!("Synthetic capture thread exiting after {} frames", frame);
            })
            .context("spawning synthetic capture thread")?;

        info!("Synthetic source streaming {}x{} at {} fps", format.width, format.height, fps);
        self.worker = Some(Worker { running, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                bail!("synthetic capture thread panicked");
            }
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let stopped = self.stop();
        self.sampler = None;
        self.format = None;
        self.committed = None;
        self.device = None;
        stopped
    }
}

impl Drop for SyntheticGraph {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Vertical colour bars scrolled left by `frame` pixels, 24 bpp BGR, bottom row
/// first. The top image row is white so orientation is visible.
pub fn render_bars(width: u32, height: u32, frame: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut data = Vec::with_capacity(w * h * 3);
    let shift = (frame % w.max(1) as u64) as usize;
    for row in 0..h {
        let top_row = row == h - 1;
        for x in 0..w {
            let px = if top_row {
                [255, 255, 255]
            } else {
                BARS[((x + shift) % w) * BARS.len() / w]
            };
            data.extend_from_slice(&px);
        }
    }
    data
}
