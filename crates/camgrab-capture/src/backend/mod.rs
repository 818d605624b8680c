//! Platform media-graph services.
//!
//! | Backend | Platform | Router |
//! |---------|----------|--------|
//! | [`directshow`] | Windows | `IAMCrossbar` |
//! | [`gst`] | any, `gstreamer` feature | none |
//! | [`synthetic`] | any | configurable |

pub mod synthetic;

#[cfg(windows)]
pub mod directshow;

#[cfg(feature = "gstreamer")]
pub mod gst;
