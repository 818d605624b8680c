//! GStreamer backend.
//!
//! ```text
//! DeviceMonitor("Video/Source") ──► gst::Device::create_element
//!                                         │
//!                             capsfilter (committed structure)
//!                                         │
//!                                  [jpegdec for MJPG]
//!                                         │
//!                                   videoconvert
//!                                         │
//!                               video/x-raw,format=BGR
//!                                         │
//!                                      appsink ──► FrameSampler::deliver
//! ```
//!
//! GStreamer exposes no portable crossbar, so this backend never reports an
//! input router.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camgrab_core::{ColorSubtype, ConnectorType, FormatCapability, SampleFormat};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, MediaBackend};
use crate::graph::NativeGraph;
use crate::negotiate::FormatSource;
use crate::sampler::FrameSampler;

/// A device found by the GStreamer device monitor.
pub struct GstDevice(gst::Device);

pub struct GstBackend;

impl GstBackend {
    pub fn new() -> Result<Self> {
        gst::init().context("GStreamer init")?;
        Ok(Self)
    }
}

impl MediaBackend for GstBackend {
    type Device = GstDevice;
    type Graph = GstGraph;

    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle<GstDevice>>> {
        let monitor = gst::DeviceMonitor::new();
        monitor.add_filter(Some("Video/Source"), None);
        monitor.start().context("starting GStreamer device monitor")?;
        let devices = monitor.devices();
        monitor.stop();

        Ok(devices
            .into_iter()
            .enumerate()
            .map(|(i, device)| {
                let name = device.display_name().to_string();
                let path = device
                    .properties()
                    .and_then(|p| p.get::<String>("device.path").ok())
                    .unwrap_or_else(|| format!("gst-device-{i}"));
                DeviceHandle::new(name, path, GstDevice(device))
            })
            .collect())
    }

    fn create_graph(&self) -> Result<GstGraph> {
        Ok(GstGraph {
            pipeline: gst::Pipeline::new(),
            source: None,
            caps: Vec::new(),
            committed: None,
            sink: None,
        })
    }
}

/// Map a raw-video `format` string onto a subtype and bit depth.
fn subtype_for(format: &str) -> Option<(ColorSubtype, u16)> {
    Some(match format {
        "BGRx" | "RGBx" | "xRGB" | "xBGR" => (ColorSubtype::Rgb32, 32),
        "BGRA" | "RGBA" | "ARGB" | "ABGR" => (ColorSubtype::Argb32, 32),
        "RGB" | "BGR" => (ColorSubtype::Rgb24, 24),
        "RGB16" | "BGR16" | "RGB15" | "BGR15" => (ColorSubtype::Rgb16, 16),
        "YUY2" => (ColorSubtype::Yuy2, 16),
        "UYVY" => (ColorSubtype::Uyvy, 16),
        "NV12" => (ColorSubtype::Nv12, 12),
        "I420" => (ColorSubtype::I420, 12),
        _ => return None,
    })
}

/// Capability for one caps structure with fixed width and height.
fn capability_from(s: &gst::StructureRef, index: usize) -> Option<FormatCapability> {
    let width = s.get::<i32>("width").ok()?;
    let height = s.get::<i32>("height").ok()?;
    let (subtype, bits_per_pixel) = match s.name().as_str() {
        "image/jpeg" => (ColorSubtype::Mjpeg, 24),
        "video/x-raw" => subtype_for(s.get::<&str>("format").ok()?)?,
        _ => return None,
    };
    Some(FormatCapability {
        width: u32::try_from(width).ok()?,
        height: u32::try_from(height).ok()?,
        bits_per_pixel,
        subtype,
        index,
    })
}

// ── GstGraph ───────────────────────────────────────────────────────────────────

pub struct GstGraph {
    pipeline: gst::Pipeline,
    source: Option<gst::Element>,
    caps: Vec<(FormatCapability, gst::Structure)>,
    committed: Option<gst::Structure>,
    sink: Option<AppSink>,
}

impl GstGraph {
    fn drain_bus(&self) {
        let Some(bus) = self.pipeline.bus() else { return };
        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::Error(e) => error!(
                    "GStreamer error from {}: {} ({:?})",
                    e.src().map(|s| s.path_string().to_string()).unwrap_or_default(),
                    e.error(),
                    e.debug()
                ),
                gst::MessageView::Warning(w) => warn!("GStreamer warning: {}", w.error()),
                _ => {}
            }
        }
    }
}

impl FormatSource for GstGraph {
    fn capability_count(&self) -> Result<usize> {
        if self.source.is_none() {
            bail!("no source in pipeline");
        }
        Ok(self.caps.len())
    }

    fn capability(&self, index: usize) -> Result<FormatCapability> {
        self.caps
            .get(index)
            .map(|(cap, _)| *cap)
            .with_context(|| format!("capability {index} out of range ({} reported)", self.caps.len()))
    }

    fn apply_format(&mut self, capability: &FormatCapability) -> Result<()> {
        let (_, structure) = self
            .caps
            .get(capability.index)
            .with_context(|| format!("capability {} out of range", capability.index))?;
        debug!("Committing source caps {}", structure);
        self.committed = Some(structure.clone());
        Ok(())
    }
}

impl NativeGraph for GstGraph {
    type Device = GstDevice;

    fn add_source(&mut self, device: &GstDevice) -> Result<()> {
        let source = device
            .0
            .create_element(Some("camgrab-source"))
            .context("creating source element")?;
        self.pipeline.add(&source).context("adding source to pipeline")?;

        self.caps.clear();
        if let Some(caps) = device.0.caps() {
            for s in caps.iter() {
                if let Some(cap) = capability_from(s, self.caps.len()) {
                    self.caps.push((cap, s.to_owned()));
                }
            }
        }
        debug!("Source '{}' reports {} usable caps structures", device.0.display_name(), self.caps.len());
        self.source = Some(source);
        Ok(())
    }

    fn router_inputs(&mut self) -> Result<Option<Vec<ConnectorType>>> {
        Ok(None)
    }

    fn route(&mut self, _input: usize) -> Result<()> {
        bail!("GStreamer sources have no input router")
    }

    fn add_sampler(&mut self, sampler: Arc<FrameSampler>) -> Result<()> {
        let sink = AppSink::builder()
            .name("camgrab-sampler")
            .caps(&gst_video::VideoCapsBuilder::new().format(gst_video::VideoFormat::Bgr).build())
            .max_buffers(2)
            .drop(true)
            .build();
        sink.set_property("sync", false);

        sink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::NotNegotiated)?;
                    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::NotNegotiated)?;
                    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
                        .map_err(|_| gst::FlowError::Error)?;

                    let format = SampleFormat::new(info.width(), info.height(), 24);
                    if sampler.format() != Some(format) {
                        sampler.set_format(format);
                    }

                    // strip row padding so the buffer is exactly width*3*height
                    let row = info.width() as usize * 3;
                    let stride = frame.plane_stride()[0] as usize;
                    let plane = frame.plane_data(0).map_err(|_| gst::FlowError::Error)?;
                    let height = info.height() as usize;
                    if stride == row {
                        sampler.deliver(&plane[..row * height]);
                    } else {
                        let mut tight = Vec::with_capacity(row * height);
                        for line in plane.chunks(stride).take(height) {
                            tight.extend_from_slice(&line[..row.min(line.len())]);
                        }
                        sampler.deliver(&tight);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        self.pipeline.add(&sink).context("adding appsink to pipeline")?;
        self.sink = Some(sink);
        Ok(())
    }

    fn connect(&mut self) -> Result<SampleFormat> {
        let source = self.source.clone().context("no source in pipeline")?;
        let sink = self.sink.clone().context("no sampler in pipeline")?;
        let structure = self.committed.clone().context("source format not set")?;
        let cap = self
            .caps
            .iter()
            .find(|(_, s)| *s == structure)
            .map(|(cap, _)| *cap)
            .context("committed caps no longer listed")?;

        let filter = gst::ElementFactory::make("capsfilter")
            .property("caps", gst::Caps::builder_full().structure(structure).build())
            .build()
            .context("creating capsfilter")?;
        let mut added = vec![filter];
        if cap.subtype == ColorSubtype::Mjpeg {
            added.push(gst::ElementFactory::make("jpegdec").build().context("creating jpegdec")?);
        }
        added.push(gst::ElementFactory::make("videoconvert").build().context("creating videoconvert")?);
        self.pipeline.add_many(&added).context("adding converter chain")?;

        let mut chain = vec![source];
        chain.extend(added);
        chain.push(sink.upcast::<gst::Element>());
        gst::Element::link_many(&chain).context("linking source to appsink")?;

        info!("GStreamer pipeline linked for {}", cap);
        Ok(SampleFormat::new(cap.width, cap.height, 24))
    }

    fn run(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("GStreamer set Playing")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let result = self.pipeline.set_state(gst::State::Null);
        self.drain_bus();
        result.context("GStreamer set Null")?;
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let result = self.pipeline.set_state(gst::State::Null);
        self.drain_bus();
        self.sink = None;
        self.source = None;
        self.committed = None;
        self.caps.clear();
        result.context("GStreamer set Null")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_formats_map_to_subtypes() {
        assert_eq!(subtype_for("BGRx"), Some((ColorSubtype::Rgb32, 32)));
        assert_eq!(subtype_for("RGB"), Some((ColorSubtype::Rgb24, 24)));
        assert_eq!(subtype_for("YUY2"), Some((ColorSubtype::Yuy2, 16)));
        assert_eq!(subtype_for("NV12"), Some((ColorSubtype::Nv12, 12)));
        assert_eq!(subtype_for("GRAY8"), None);
    }

    #[test]
    fn structures_with_fixed_size_become_capabilities() {
        gst::init().unwrap();
        let raw = gst::Structure::builder("video/x-raw")
            .field("format", "YUY2")
            .field("width", 640i32)
            .field("height", 480i32)
            .build();
        let cap = capability_from(&raw, 3).unwrap();
        assert_eq!((cap.width, cap.height, cap.bits_per_pixel, cap.index), (640, 480, 16, 3));

        let jpeg = gst::Structure::builder("image/jpeg")
            .field("width", 1280i32)
            .field("height", 720i32)
            .build();
        assert_eq!(capability_from(&jpeg, 0).unwrap().subtype, ColorSubtype::Mjpeg);

        let ranged = gst::Structure::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", gst::IntRange::new(1, 4096))
            .field("height", 480i32)
            .build();
        assert!(capability_from(&ranged, 0).is_none());
    }
}
