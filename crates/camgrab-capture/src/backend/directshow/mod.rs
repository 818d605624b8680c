//! DirectShow backend (Windows).
//!
//! ```text
//! ICreateDevEnum(VideoInputDeviceCategory) ──► IBaseFilter (source)
//!   │  ICaptureGraphBuilder2::FindInterface(PIN_CATEGORY_CAPTURE) → IAMStreamConfig
//!   │  ICaptureGraphBuilder2::FindInterface(LOOK_UPSTREAM_ONLY)   → IAMCrossbar
//!   ▼
//! RenderStream: source ─► [colour converter] ─► SampleGrabber(RGB24) ─► Null Renderer
//!                                                   │  ISampleGrabberCB::BufferCB
//!                                                   ▼
//!                                        FrameSampler::deliver
//! ```
//!
//! COM objects are apartment-bound: the graph must be used on the thread that
//! created it.

mod grabber;
mod media_type;

use std::ffi::c_void;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camgrab_core::{ConnectorType, FormatCapability, SampleFormat};
use tracing::{debug, info, warn};
use windows::core::{w, Interface, BSTR, GUID};
use windows::Win32::Foundation::BOOL;
use windows::Win32::Media::DirectShow::{
    IAMCrossbar, IAMStreamConfig, IBaseFilter, ICaptureGraphBuilder2, ICreateDevEnum, IGraphBuilder,
    IMediaControl, PhysicalConnectorType,
};
use windows::Win32::Media::MediaFoundation::{
    AM_MEDIA_TYPE, CLSID_SystemDeviceEnum, CLSID_VideoInputDeviceCategory,
};
use windows::Win32::System::Com::StructuredStorage::IPropertyBag;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, IBindCtx, IErrorLog, IMoniker, CLSCTX_INPROC_SERVER,
    COINIT_MULTITHREADED,
};
use windows::Win32::System::Variant::VARIANT;

use self::grabber::{GrabberCallback, SampleGrabber};
use self::media_type::{OwnedMediaType, LOOK_UPSTREAM_ONLY, MEDIATYPE_VIDEO, PIN_CATEGORY_CAPTURE};
use crate::device::{DeviceHandle, MediaBackend};
use crate::graph::NativeGraph;
use crate::negotiate::FormatSource;
use crate::sampler::FrameSampler;

// CLSID_FilterGraph: {E436EBB3-524F-11CE-9F53-0020AF0BA770}
const CLSID_FILTER_GRAPH: GUID = GUID::from_u128(0xe436ebb3_524f_11ce_9f53_0020af0ba770);

// CLSID_CaptureGraphBuilder2: {BF87B6E1-8C27-11D0-B3F0-00AA003761C5}
const CLSID_CAPTURE_GRAPH_BUILDER2: GUID = GUID::from_u128(0xbf87b6e1_8c27_11d0_b3f0_00aa003761c5);

// CLSID_SampleGrabber: {C1F400A0-3F08-11D3-9F0B-006008039E37}
const CLSID_SAMPLE_GRABBER: GUID = GUID::from_u128(0xc1f400a0_3f08_11d3_9f0b_006008039e37);

// CLSID_NullRenderer: {C1F400A4-3F08-11D3-9F0B-006008039E37}
const CLSID_NULL_RENDERER: GUID = GUID::from_u128(0xc1f400a4_3f08_11d3_9f0b_006008039e37);

/// `PhysConn_Video_VideoDecoder`: the crossbar output feeding the capture filter.
const PHYSCONN_VIDEO_DECODER: i32 = 12;

// ── COM apartment ──────────────────────────────────────────────────────────────

/// Joins the multithreaded apartment for as long as it lives.
struct ComGuard;

impl ComGuard {
    fn init() -> Result<Self> {
        // SAFETY: paired with CoUninitialize in Drop.
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
            .ok()
            .context("CoInitializeEx")?;
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
    }
}

// ── Device enumeration ─────────────────────────────────────────────────────────

/// Identity of a video input device. The filter itself is bound per graph.
#[derive(Debug, Clone)]
pub struct DirectShowDevice {
    pub friendly_name: String,
    /// Empty for virtual devices without a `DevicePath` property.
    pub device_path: String,
}

fn read_property(bag: &IPropertyBag, name: &str) -> Option<String> {
    let key = BSTR::from(name);
    let mut value = VARIANT::default();
    // SAFETY: `key` and `value` outlive the call.
    unsafe { bag.Read(windows::core::PCWSTR(key.as_ptr()), &mut value, None::<&IErrorLog>) }.ok()?;
    BSTR::try_from(&value).ok().map(|s| s.to_string())
}

/// Walk the video input category; `visit` returns `true` to stop early.
fn for_each_video_input(mut visit: impl FnMut(&IMoniker, DirectShowDevice) -> Result<bool>) -> Result<()> {
    // SAFETY: standard device enumeration on an initialised apartment.
    unsafe {
        let dev_enum: ICreateDevEnum = CoCreateInstance(&CLSID_SystemDeviceEnum, None, CLSCTX_INPROC_SERVER)
            .context("CoCreateInstance(SystemDeviceEnum)")?;
        let mut monikers = None;
        dev_enum
            .CreateClassEnumerator(&CLSID_VideoInputDeviceCategory, &mut monikers, 0)
            .context("CreateClassEnumerator")?;
        // S_FALSE with no enumerator: the category is empty
        let Some(monikers) = monikers else { return Ok(()) };

        let mut slot = [None; 1];
        while monikers.Next(&mut slot, None).is_ok() {
            let Some(moniker) = slot[0].take() else { break };
            let bag: IPropertyBag = match moniker.BindToStorage(None::<&IBindCtx>, None::<&IMoniker>) {
                Ok(bag) => bag,
                Err(e) => {
                    debug!("Skipping device without property bag: {}", e);
                    continue;
                }
            };
            let device = DirectShowDevice {
                friendly_name: read_property(&bag, "FriendlyName").unwrap_or_else(|| "Unknown device".into()),
                device_path: read_property(&bag, "DevicePath").unwrap_or_default(),
            };
            if visit(&moniker, device)? {
                break;
            }
        }
    }
    Ok(())
}

fn bind_source(wanted: &DirectShowDevice) -> Result<IBaseFilter> {
    let mut found = None;
    for_each_video_input(|moniker, device| {
        let matches = if wanted.device_path.is_empty() {
            device.friendly_name == wanted.friendly_name
        } else {
            device.device_path == wanted.device_path
        };
        if matches {
            // SAFETY: binding a moniker returned by the enumerator.
            let filter: IBaseFilter = unsafe { moniker.BindToObject(None::<&IBindCtx>, None::<&IMoniker>) }
                .context("BindToObject")?;
            found = Some(filter);
        }
        Ok(matches)
    })?;
    found.with_context(|| format!("device '{}' no longer present", wanted.friendly_name))
}

pub struct DirectShowBackend;

impl DirectShowBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectShowBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for DirectShowBackend {
    type Device = DirectShowDevice;
    type Graph = DirectShowGraph;

    fn name(&self) -> &'static str {
        "directshow"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle<DirectShowDevice>>> {
        let _com = ComGuard::init()?;
        let mut devices = Vec::new();
        for_each_video_input(|_, device| {
            let path = if device.device_path.is_empty() {
                device.friendly_name.clone()
            } else {
                device.device_path.clone()
            };
            devices.push(DeviceHandle::new(device.friendly_name.clone(), path, device));
            Ok(false)
        })?;
        Ok(devices)
    }

    fn create_graph(&self) -> Result<DirectShowGraph> {
        DirectShowGraph::new()
    }
}

// ── DirectShowGraph ────────────────────────────────────────────────────────────

struct Crossbar {
    crossbar: IAMCrossbar,
    output: i32,
    /// (input pin, connector) for every video input pin.
    inputs: Vec<(i32, ConnectorType)>,
}

struct Sampler {
    filter: IBaseFilter,
    grabber: SampleGrabber,
    renderer: IBaseFilter,
    _callback: GrabberCallback,
}

pub struct DirectShowGraph {
    graph: IGraphBuilder,
    builder: ICaptureGraphBuilder2,
    control: IMediaControl,
    source: Option<IBaseFilter>,
    stream_config: Option<IAMStreamConfig>,
    caps_size: usize,
    crossbar: Option<Crossbar>,
    sampler: Option<Sampler>,
    // dropped last: every interface above must be released inside the apartment
    _com: ComGuard,
}

impl DirectShowGraph {
    fn new() -> Result<Self> {
        let com = ComGuard::init()?;
        // SAFETY: COM is initialised for this thread by `com`.
        unsafe {
            let graph: IGraphBuilder = CoCreateInstance(&CLSID_FILTER_GRAPH, None, CLSCTX_INPROC_SERVER)
                .context("CoCreateInstance(FilterGraph)")?;
            let builder: ICaptureGraphBuilder2 =
                CoCreateInstance(&CLSID_CAPTURE_GRAPH_BUILDER2, None, CLSCTX_INPROC_SERVER)
                    .context("CoCreateInstance(CaptureGraphBuilder2)")?;
            builder.SetFiltergraph(&graph).context("SetFiltergraph")?;
            let control: IMediaControl = graph.cast().context("IMediaControl")?;
            Ok(Self {
                graph,
                builder,
                control,
                source: None,
                stream_config: None,
                caps_size: 0,
                crossbar: None,
                sampler: None,
                _com: com,
            })
        }
    }

    fn source(&self) -> Result<&IBaseFilter> {
        self.source.as_ref().context("no source filter in graph")
    }

    fn stream_config(&self) -> Result<&IAMStreamConfig> {
        self.stream_config.as_ref().context("source has no IAMStreamConfig")
    }

    /// `FindInterface` on the source filter, typed.
    fn find_interface<T: Interface>(&self, category: &GUID, media: Option<&GUID>) -> Result<T> {
        let source = self.source()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: on success `ptr` holds a reference we take ownership of.
        unsafe {
            self.builder
                .FindInterface(Some(category), media.map(|m| m as *const GUID), source, &T::IID, &mut ptr)
                .with_context(|| format!("FindInterface({:?})", T::IID))?;
            if ptr.is_null() {
                bail!("FindInterface returned null");
            }
            Ok(T::from_raw(ptr))
        }
    }

    fn stream_caps(&self, index: usize) -> Result<OwnedMediaType> {
        let config = self.stream_config()?;
        let mut scc = vec![0u8; self.caps_size.max(128)];
        let mut pmt: *mut AM_MEDIA_TYPE = std::ptr::null_mut();
        // SAFETY: `scc` is at least the size the device reported.
        unsafe {
            config
                .GetStreamCaps(index as i32, &mut pmt, scc.as_mut_ptr())
                .with_context(|| format!("GetStreamCaps({index})"))?;
            OwnedMediaType::from_raw(pmt).context("GetStreamCaps returned no media type")
        }
    }
}

impl FormatSource for DirectShowGraph {
    fn capability_count(&self) -> Result<usize> {
        let (mut count, mut size) = (0i32, 0i32);
        // SAFETY: out-params only.
        unsafe { self.stream_config()?.GetNumberOfCapabilities(&mut count, &mut size) }
            .context("GetNumberOfCapabilities")?;
        Ok(count.max(0) as usize)
    }

    fn capability(&self, index: usize) -> Result<FormatCapability> {
        // the media type is freed when `mt` drops at the end of this call
        let mt = self.stream_caps(index)?;
        Ok(mt.capability(index))
    }

    fn apply_format(&mut self, capability: &FormatCapability) -> Result<()> {
        let mt = self.stream_caps(capability.index)?;
        // SAFETY: SetFormat copies the media type.
        unsafe { self.stream_config()?.SetFormat(mt.as_ptr()) }
            .with_context(|| format!("SetFormat({})", capability))?;
        Ok(())
    }
}

impl NativeGraph for DirectShowGraph {
    type Device = DirectShowDevice;

    fn add_source(&mut self, device: &DirectShowDevice) -> Result<()> {
        let source = bind_source(device)?;
        // SAFETY: adding a bound filter to our graph.
        unsafe { self.graph.AddFilter(&source, w!("Capture Source")) }.context("AddFilter(source)")?;
        self.source = Some(source);

        let config: IAMStreamConfig = self.find_interface(&PIN_CATEGORY_CAPTURE, Some(&MEDIATYPE_VIDEO))?;
        let (mut count, mut size) = (0i32, 0i32);
        unsafe { config.GetNumberOfCapabilities(&mut count, &mut size) }.context("GetNumberOfCapabilities")?;
        self.caps_size = size.max(0) as usize;
        self.stream_config = Some(config);
        info!("Source '{}' added ({} stream capabilities)", device.friendly_name, count);
        Ok(())
    }

    fn router_inputs(&mut self) -> Result<Option<Vec<ConnectorType>>> {
        let crossbar: IAMCrossbar = match self.find_interface(&LOOK_UPSTREAM_ONLY, None) {
            Ok(crossbar) => crossbar,
            Err(e) => {
                debug!("No crossbar upstream of source: {:#}", e);
                return Ok(None);
            }
        };

        let (mut outputs, mut inputs) = (0i32, 0i32);
        unsafe { crossbar.get_PinCounts(&mut outputs, &mut inputs) }.context("IAMCrossbar::get_PinCounts")?;

        let pin_type = |input: bool, pin: i32| -> Result<i32> {
            let mut related = 0i32;
            let mut kind = PhysicalConnectorType::default();
            unsafe { crossbar.get_CrossbarPinInfo(BOOL::from(input), pin, &mut related, &mut kind) }
                .with_context(|| format!("get_CrossbarPinInfo({pin})"))?;
            Ok(kind.0)
        };

        let mut output = None;
        for pin in 0..outputs {
            if pin_type(false, pin)? == PHYSCONN_VIDEO_DECODER {
                output = Some(pin);
                break;
            }
        }
        let Some(output) = output else {
            warn!("Crossbar has no video decoder output; ignoring it");
            return Ok(None);
        };

        let mut video_inputs = Vec::new();
        for pin in 0..inputs {
            // audio connectors map to None
            if let Some(connector) = ConnectorType::from_raw(pin_type(true, pin)?) {
                video_inputs.push((pin, connector));
            }
        }
        let connectors = video_inputs.iter().map(|(_, c)| *c).collect();
        self.crossbar = Some(Crossbar { crossbar, output, inputs: video_inputs });
        Ok(Some(connectors))
    }

    fn route(&mut self, input: usize) -> Result<()> {
        let crossbar = self.crossbar.as_ref().context("no crossbar in graph")?;
        let (pin, connector) = *crossbar
            .inputs
            .get(input)
            .with_context(|| format!("crossbar has no video input {input}"))?;
        unsafe { crossbar.crossbar.Route(crossbar.output, pin) }
            .with_context(|| format!("IAMCrossbar::Route({}, {})", crossbar.output, pin))?;
        debug!("Crossbar output {} ← input {} ({:?})", crossbar.output, pin, connector);
        Ok(())
    }

    fn add_sampler(&mut self, sampler: Arc<FrameSampler>) -> Result<()> {
        // SAFETY: filters are created and added on the graph's apartment thread.
        unsafe {
            let filter: IBaseFilter = CoCreateInstance(&CLSID_SAMPLE_GRABBER, None, CLSCTX_INPROC_SERVER)
                .context("CoCreateInstance(SampleGrabber)")?;
            self.graph.AddFilter(&filter, w!("Sample Grabber")).context("AddFilter(grabber)")?;

            let grabber = SampleGrabber::from_filter(&filter)?;
            grabber.set_media_type(&media_type::rgb24_request()).context("SetMediaType(RGB24)")?;
            grabber.set_one_shot(false).context("SetOneShot")?;
            grabber.set_buffer_samples(false).context("SetBufferSamples")?;
            let callback = GrabberCallback::new(sampler);
            grabber.set_callback(&callback).context("SetCallback")?;

            let renderer: IBaseFilter = CoCreateInstance(&CLSID_NULL_RENDERER, None, CLSCTX_INPROC_SERVER)
                .context("CoCreateInstance(NullRenderer)")?;
            self.graph.AddFilter(&renderer, w!("Null Renderer")).context("AddFilter(null renderer)")?;

            self.sampler = Some(Sampler { filter, grabber, renderer, _callback: callback });
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<SampleFormat> {
        let source = self.source()?;
        let sampler = self.sampler.as_ref().context("no sample grabber in graph")?;
        // SAFETY: all three filters are in our graph.
        unsafe {
            self.builder
                .RenderStream(
                    Some(&PIN_CATEGORY_CAPTURE),
                    Some(&MEDIATYPE_VIDEO),
                    source,
                    &sampler.filter,
                    &sampler.renderer,
                )
                .context("RenderStream(source → grabber → renderer)")?;
        }
        let mt = sampler.grabber.connected_media_type().context("GetConnectedMediaType")?;
        let format = mt.sample_format().context("grabber connected without a VideoInfo format")?;
        info!(
            "Grabber connected at {}x{} {}bpp{}",
            format.width,
            format.height,
            format.bits_per_pixel,
            if format.bottom_up { " (bottom-up)" } else { "" }
        );
        Ok(format)
    }

    fn run(&mut self) -> Result<()> {
        unsafe { self.control.Run() }.context("IMediaControl::Run")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        unsafe { self.control.Stop() }.context("IMediaControl::Stop")?;
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let stopped = self.stop();
        if let Some(sampler) = self.sampler.take() {
            if let Err(e) = sampler.grabber.clear_callback() {
                warn!("Clearing grabber callback failed: {:#}", e);
            }
        }
        self.crossbar = None;
        self.stream_config = None;
        self.source = None;

        // every filter, including those RenderStream inserted
        let mut filters = Vec::new();
        unsafe {
            let list = self.graph.EnumFilters().context("EnumFilters")?;
            let mut slot = [None; 1];
            while list.Next(&mut slot, None).is_ok() {
                let Some(filter) = slot[0].take() else { break };
                filters.push(filter);
            }
            for filter in &filters {
                if let Err(e) = self.graph.RemoveFilter(filter) {
                    warn!("RemoveFilter failed: {}", e);
                }
            }
        }
        debug!("Removed {} filters from graph", filters.len());
        stopped
    }
}
