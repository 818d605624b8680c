pub mod config;
pub mod errors;
pub mod types;

pub use config::{CaptureConfig, FormatPolicy, DEFAULT_BIT_DEPTHS, DEFAULT_SUBTYPES};
pub use errors::{CaptureError, CaptureResult};
pub use types::*;
