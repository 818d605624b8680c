//! Frame sampler: the hand-off point between the capture thread and the consumer.
//!
//! # Threading model
//!
//! The native pipeline calls [`FrameSampler::deliver`] on a thread we do not
//! control. Everything mutable sits behind one mutex:
//!
//! ```text
//! capture thread ── deliver() ──┐
//!                               ▼
//!                  Mutex<Shared { slot, format, attached, stats }>
//!                               ▲
//! consumer thread ─ snapshot_next_frame() / dispose() / ready()
//! ```
//!
//! Push mode converts and calls the callback while the lock is held, so once
//! [`FrameSampler::dispose`] returns no callback is running and none will run
//! again. Pull mode keeps exactly one raw frame; a newer frame replaces an
//! unread one.

use camgrab_core::{CaptureError, CaptureResult, DeliveryMode, GraphState, Rotation, SampleFormat};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::convert;

/// Receives converted frames in push mode. Runs on the capture thread with the
/// sampler lock held; it must not call back into the same sampler.
pub type FrameCallback = Box<dyn FnMut(RgbImage) + Send>;

/// Delivery choice made when the graph is built.
pub enum FrameDelivery {
    Push(FrameCallback),
    Pull,
}

impl FrameDelivery {
    pub fn push(callback: impl FnMut(RgbImage) + Send + 'static) -> Self {
        Self::Push(Box::new(callback))
    }

    pub fn mode(&self) -> DeliveryMode {
        match self {
            Self::Push(_) => DeliveryMode::Push,
            Self::Pull => DeliveryMode::Pull,
        }
    }
}

impl std::fmt::Debug for FrameDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push(_) => f.write_str("Push(..)"),
            Self::Pull => f.write_str("Pull"),
        }
    }
}

/// What happened to one delivered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pull mode: held as the latest frame.
    Stored,
    /// Push mode: converted and passed to the callback.
    Forwarded,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    NoFormat,
    SizeMismatch,
    ConversionFailed,
    Disposed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct RawFrame {
    data: Vec<u8>,
    format: SampleFormat,
}

enum Slot {
    /// Pull mode, nothing waiting.
    Empty,
    Holding(RawFrame),
    Callback { callback: FrameCallback, rotation: Rotation },
    Disposed,
}

struct Shared {
    slot: Slot,
    format: Option<SampleFormat>,
    attached: bool,
    stats: SamplerStats,
}

impl Shared {
    fn drop_frame(&mut self, reason: DropReason) -> Delivery {
        self.stats.dropped += 1;
        Delivery::Dropped(reason)
    }
}

pub struct FrameSampler {
    mode: DeliveryMode,
    shared: Mutex<Shared>,
}

impl FrameSampler {
    /// `rotation` applies to push-mode frames; pull mode takes it per snapshot.
    pub fn new(delivery: FrameDelivery, rotation: Rotation) -> Self {
        let mode = delivery.mode();
        let slot = match delivery {
            FrameDelivery::Push(callback) => Slot::Callback { callback, rotation },
            FrameDelivery::Pull => Slot::Empty,
        };
        Self {
            mode,
            shared: Mutex::new(Shared {
                slot,
                format: None,
                attached: false,
                stats: SamplerStats::default(),
            }),
        }
    }

    pub fn pull() -> Self {
        Self::new(FrameDelivery::Pull, Rotation::None)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Record the format negotiated on the sampler input. Called by the native
    /// adapter on connect and whenever the upstream format changes.
    pub fn set_format(&self, format: SampleFormat) {
        let mut shared = self.shared.lock();
        if shared.format != Some(format) {
            debug!(
                "Sampler format {}x{} {}bpp{}",
                format.width,
                format.height,
                format.bits_per_pixel,
                if format.bottom_up { " bottom-up" } else { "" }
            );
        }
        shared.format = Some(format);
    }

    pub fn format(&self) -> Option<SampleFormat> {
        self.shared.lock().format
    }

    /// Mark the sampler as connected to a live pipeline.
    pub fn attach(&self) {
        let mut shared = self.shared.lock();
        if !matches!(shared.slot, Slot::Disposed) {
            shared.attached = true;
        }
    }

    /// Whether the sampler is connected to a pipeline and not yet disposed.
    pub fn ready(&self) -> bool {
        self.shared.lock().attached
    }

    pub fn stats(&self) -> SamplerStats {
        self.shared.lock().stats
    }

    /// Accept one raw buffer from the pipeline. `data` is only borrowed for the
    /// duration of the call; whatever is kept is copied first.
    ///
    /// Never fails: bad frames are logged, counted and dropped.
    pub fn deliver(&self, data: &[u8]) -> Delivery {
        if data.is_empty() {
            warn!("Sampler: zero-length buffer dropped");
            let mut shared = self.shared.lock();
            return shared.drop_frame(DropReason::Empty);
        }

        let mut shared = self.shared.lock();
        if matches!(shared.slot, Slot::Disposed) {
            return shared.drop_frame(DropReason::Disposed);
        }

        let Some(format) = shared.format else {
            debug!("Sampler: buffer before format negotiation dropped");
            return shared.drop_frame(DropReason::NoFormat);
        };
        let expected = format.frame_len();
        if expected != Some(data.len()) {
            warn!(
                "Sampler: buffer of {} bytes does not match {}x{}@{}bpp ({:?} expected)",
                data.len(),
                format.width,
                format.height,
                format.bits_per_pixel,
                expected
            );
            return shared.drop_frame(DropReason::SizeMismatch);
        }

        let raw = RawFrame { data: data.to_vec(), format };
        shared.stats.delivered += 1;
        let count = shared.stats.delivered;

        let outcome = match &mut shared.slot {
            Slot::Callback { callback, rotation } => match convert::convert(&raw.data, &raw.format, *rotation) {
                Ok(image) => {
                    drop(raw);
                    callback(image);
                    Delivery::Forwarded
                }
                Err(e) => {
                    warn!("Sampler: frame {} not converted: {}", count, e);
                    Delivery::Dropped(DropReason::ConversionFailed)
                }
            },
            slot => {
                // the previous unread frame, if any, is freed here
                *slot = Slot::Holding(raw);
                Delivery::Stored
            }
        };
        if let Delivery::Dropped(_) = outcome {
            shared.stats.delivered -= 1;
            shared.stats.dropped += 1;
        }

        if count <= 3 {
            info!(
                "Sampler: frame {} ({}x{} {}bpp, {} bytes) {:?}",
                count, format.width, format.height, format.bits_per_pixel, data.len(), outcome
            );
        }
        outcome
    }

    /// Take the latest frame, converted to RGB and rotated. Pull mode only.
    ///
    /// The held raw buffer is consumed whether conversion succeeds or not.
    pub fn snapshot_next_frame(&self, rotation: Rotation) -> CaptureResult<RgbImage> {
        let mut shared = self.shared.lock();
        match std::mem::replace(&mut shared.slot, Slot::Empty) {
            Slot::Holding(raw) => convert::convert(&raw.data, &raw.format, rotation),
            Slot::Empty => Err(CaptureError::NoFrameAvailable),
            other @ Slot::Callback { .. } => {
                shared.slot = other;
                Err(CaptureError::invalid_state(
                    GraphState::Built,
                    "snapshots need a pull-mode sampler",
                ))
            }
            Slot::Disposed => {
                shared.slot = Slot::Disposed;
                Err(CaptureError::invalid_state(GraphState::Closed, "sampler has been disposed"))
            }
        }
    }

    /// Drop the callback or held frame and refuse all later deliveries.
    /// Blocks until an in-flight delivery has finished. Idempotent.
    pub fn dispose(&self) {
        let mut shared = self.shared.lock();
        if matches!(shared.slot, Slot::Disposed) {
            return;
        }
        shared.slot = Slot::Disposed;
        shared.attached = false;
        debug!(
            "Sampler disposed ({} delivered, {} dropped)",
            shared.stats.delivered, shared.stats.dropped
        );
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.shared.lock().slot, Slot::Disposed)
    }
}

impl std::fmt::Debug for FrameSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("FrameSampler")
            .field("mode", &self.mode)
            .field("format", &shared.format)
            .field("attached", &shared.attached)
            .field("stats", &shared.stats)
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
