use thiserror::Error;

use crate::types::GraphState;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture devices found")]
    NoDevicesFound,

    #[error("Capture device #{index} not found ({count} devices available)")]
    DeviceNotFound { index: usize, count: usize },

    #[error("No device format matches {requested}")]
    UnsupportedFormat { requested: String },

    #[error("Unsupported pixel format: {bits_per_pixel} bits per pixel")]
    UnsupportedPixelFormat { bits_per_pixel: u16 },

    #[error("Invalid state transition from {state}: {reason}")]
    InvalidStateTransition { state: GraphState, reason: String },

    #[error("No frame available")]
    NoFrameAvailable,

    #[error("Graph construction failed at {stage}: {reason}")]
    GraphConstructionFailed { stage: &'static str, reason: String },

    #[error("{operation} failed: {reason}")]
    Backend { operation: &'static str, reason: String },

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    pub fn invalid_state(state: GraphState, reason: impl Into<String>) -> Self {
        Self::InvalidStateTransition { state, reason: reason.into() }
    }

    /// Wraps a native failure raised while building the graph. The alternate
    /// formatter keeps the whole `anyhow` context chain in `reason`.
    pub fn construction(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::GraphConstructionFailed { stage, reason: format!("{err:#}") }
    }

    pub fn backend(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend { operation, reason: format!("{err:#}") }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
