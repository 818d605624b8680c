//! Live capture pipeline.
//!
//! # Pipeline
//!
//! ```text
//! DeviceEnumerator ──► DeviceHandle
//!                          │  CaptureSession::open
//!                          ▼
//! CaptureGraph::build
//!   ├─ add_source
//!   ├─ negotiate::select_format      (first full match, else first fallback)
//!   ├─ router_inputs / route         (optional input router)
//!   ├─ add_sampler                   (RGB24, push or pull)
//!   └─ connect                       → negotiated SampleFormat
//!                          │
//!  capture thread ── FrameSampler::deliver ──► [latest raw frame | callback]
//!                          │
//!  consumer ──── CaptureSession::snapshot_next_frame ──► RgbImage
//! ```
//!
//! Native services sit behind [`MediaBackend`] / [`NativeGraph`]; see [`backend`].

pub mod backend;
pub mod convert;
pub mod device;
pub mod graph;
pub mod negotiate;
pub mod sampler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use device::{DeviceEnumerator, DeviceHandle, MediaBackend};
pub use graph::{select_router_pin, CaptureGraph, NativeGraph};
pub use negotiate::{choose_format, list_resolutions, probe_resolutions, select_format, FormatSource};
pub use sampler::{Delivery, DropReason, FrameCallback, FrameDelivery, FrameSampler, SamplerStats};
pub use session::CaptureSession;
