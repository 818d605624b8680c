//! Capture graph lifecycle: source → optional input router → frame sampler.
//!
//! ```text
//!            build()              run()
//!   Closed ──────────► Built ──────────► Running
//!     ▲                  ▲    ◄──────────   │
//!     │                  │      stop()      │
//!     └──── close_all() ─┴──────────────────┘
//! ```
//!
//! Every failed build step unwinds through [`CaptureGraph::close_all`] before
//! the error is returned, so a failed build always leaves the graph `Closed`
//! with no sampler.

use std::sync::Arc;

use anyhow::Result;
use camgrab_core::{
    CaptureError, CaptureResult, ConnectorType, FormatCapability, FormatPolicy, GraphState,
    Resolution, Rotation, SampleFormat, VideoInput,
};
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, MediaBackend};
use crate::negotiate::{self, FormatSource};
use crate::sampler::{FrameDelivery, FrameSampler};

/// One native processing graph, driven stage by stage by [`CaptureGraph`].
///
/// Implementations hold native (often thread-affine) objects and are not
/// required to be `Send`.
pub trait NativeGraph: FormatSource {
    type Device;

    /// Attach the capture source bound to `device`.
    fn add_source(&mut self, device: &Self::Device) -> Result<()>;

    /// Attach the source's input router, if it has one, and list its video
    /// inputs in pin order. `None` means the source has no router.
    fn router_inputs(&mut self) -> Result<Option<Vec<ConnectorType>>>;

    /// Route router input `input` (an index into [`Self::router_inputs`]) to
    /// the video output.
    fn route(&mut self, input: usize) -> Result<()>;

    /// Attach the frame sampler, configured for 24-bit RGB input.
    fn add_sampler(&mut self, sampler: Arc<FrameSampler>) -> Result<()>;

    /// Connect source output to sampler input and report the format agreed on
    /// the sampler pin.
    fn connect(&mut self) -> Result<SampleFormat>;

    fn run(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Detach every stage and release native resources. Called at most once
    /// per graph.
    fn teardown(&mut self) -> Result<()>;
}

/// Pin index of the `index`-th router input carrying `connector`.
pub fn select_router_pin(inputs: &[ConnectorType], wanted: VideoInput) -> Option<usize> {
    let VideoInput::Connector { connector, index } = wanted else {
        return None;
    };
    inputs
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == connector)
        .nth(index as usize)
        .map(|(pin, _)| pin)
}

/// Router inputs as selectable [`VideoInput`] values, numbered per connector type.
pub fn video_inputs_of(inputs: &[ConnectorType]) -> Vec<VideoInput> {
    inputs
        .iter()
        .enumerate()
        .map(|(pin, connector)| {
            let ordinal = inputs[..pin].iter().filter(|c| *c == connector).count();
            VideoInput::new(*connector, ordinal as u32)
        })
        .collect()
}

// ── CaptureGraph ───────────────────────────────────────────────────────────────

pub struct CaptureGraph<B: MediaBackend> {
    backend: Arc<B>,
    native: Option<B::Graph>,
    sampler: Option<Arc<FrameSampler>>,
    state: GraphState,
    /// Pins both policy dimensions at build; survives `close_all`.
    requested: Option<Resolution>,
    /// Agreed on the sampler pin by the last successful build.
    built_resolution: Option<Resolution>,
    negotiated: Option<FormatCapability>,
    policy: FormatPolicy,
    video_input: VideoInput,
    inputs: Vec<VideoInput>,
}

impl<B: MediaBackend> CaptureGraph<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            native: None,
            sampler: None,
            state: GraphState::Closed,
            requested: None,
            built_resolution: None,
            negotiated: None,
            policy: FormatPolicy::default(),
            video_input: VideoInput::Default,
            inputs: Vec::new(),
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Negotiated resolution while built, the requested one otherwise.
    pub fn resolution(&self) -> Option<Resolution> {
        self.built_resolution.or(self.requested)
    }

    pub fn requested_resolution(&self) -> Option<Resolution> {
        self.requested
    }

    /// Capability committed by the last successful build.
    pub fn negotiated(&self) -> Option<FormatCapability> {
        self.negotiated
    }

    pub fn policy(&self) -> &FormatPolicy {
        &self.policy
    }

    pub fn video_input(&self) -> VideoInput {
        self.video_input
    }

    /// Router inputs found during the last build; empty without a router.
    pub fn video_inputs(&self) -> &[VideoInput] {
        &self.inputs
    }

    pub fn sampler(&self) -> Option<&Arc<FrameSampler>> {
        self.sampler.as_ref()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Native graph of a built session, for format queries.
    pub fn native(&self) -> Option<&B::Graph> {
        self.native.as_ref()
    }

    pub fn change_resolution(&mut self, resolution: Resolution) -> CaptureResult<()> {
        self.require_closed("resolution is fixed once the graph is built")?;
        self.requested = Some(resolution);
        Ok(())
    }

    pub fn set_video_input(&mut self, input: VideoInput) -> CaptureResult<()> {
        self.require_closed("video input is fixed once the graph is built")?;
        self.video_input = input;
        Ok(())
    }

    /// Replace the negotiation policy. Its dimensions replace the requested
    /// resolution: both pinned sets it, anything else clears it.
    pub fn set_policy(&mut self, policy: FormatPolicy) -> CaptureResult<()> {
        self.require_closed("format policy is fixed once the graph is built")?;
        self.requested = match (policy.width, policy.height) {
            (Some(width), Some(height)) => Some(Resolution::new(width, height)),
            _ => None,
        };
        self.policy = policy;
        Ok(())
    }

    fn require_closed(&self, reason: &str) -> CaptureResult<()> {
        if self.state.is_built() {
            return Err(CaptureError::invalid_state(self.state, reason));
        }
        Ok(())
    }

    /// Build the graph for `device` and return the negotiated resolution.
    pub fn build(
        &mut self,
        device: &DeviceHandle<B::Device>,
        delivery: FrameDelivery,
        rotation: Rotation,
    ) -> CaptureResult<Resolution> {
        self.require_closed("graph is already built")?;
        info!("Building {} capture graph for '{}'", self.backend.name(), device.name());

        match self.try_build(device, delivery, rotation) {
            Ok(resolution) => {
                self.state = GraphState::Built;
                info!("Capture graph built at {}", resolution);
                Ok(resolution)
            }
            Err(e) => {
                warn!("Capture graph build failed: {}", e);
                self.close_all();
                Err(e)
            }
        }
    }

    fn try_build(
        &mut self,
        device: &DeviceHandle<B::Device>,
        delivery: FrameDelivery,
        rotation: Rotation,
    ) -> CaptureResult<Resolution> {
        // ── 1. Graph container ─────────────────────────────────────────────
        let graph = self
            .backend
            .create_graph()
            .map_err(|e| CaptureError::construction("create graph", e))?;
        let native = self.native.insert(graph);

        // ── 2. Capture source ──────────────────────────────────────────────
        native
            .add_source(device.device())
            .map_err(|e| CaptureError::construction("add source", e))?;

        // ── 3. Output format ───────────────────────────────────────────────
        let policy = match self.requested {
            Some(requested) => self.policy.with_resolution(Some(requested)),
            None => self.policy.clone(),
        };
        let capability = negotiate::select_format(native, &policy)?;
        if !capability.subtype.is_rgb() {
            debug!("{} is converted to RGB24 before the sampler", capability.subtype);
        }

        // ── 4. Input router ────────────────────────────────────────────────
        self.inputs.clear();
        let router = native
            .router_inputs()
            .map_err(|e| CaptureError::construction("add router", e))?;
        if let Some(connectors) = router {
            self.inputs = video_inputs_of(&connectors);
            debug!("Router inputs: {:?}", self.inputs);
            if !self.video_input.is_default() {
                match select_router_pin(&connectors, self.video_input) {
                    Some(pin) => {
                        native
                            .route(pin)
                            .map_err(|e| CaptureError::construction("route input", e))?;
                        info!("Routed router input {} ({:?})", pin, self.video_input);
                    }
                    None => warn!(
                        "Requested input {:?} not on router; keeping default routing",
                        self.video_input
                    ),
                }
            }
        } else if !self.video_input.is_default() {
            warn!("Device has no input router; ignoring {:?}", self.video_input);
        }

        // ── 5. Frame sampler ───────────────────────────────────────────────
        let sampler = Arc::new(FrameSampler::new(delivery, rotation));
        self.sampler = Some(Arc::clone(&sampler));
        native
            .add_sampler(Arc::clone(&sampler))
            .map_err(|e| CaptureError::construction("add sampler", e))?;

        // ── 6. Connect source → sampler ────────────────────────────────────
        let format = native
            .connect()
            .map_err(|e| CaptureError::construction("connect", e))?;
        sampler.set_format(format);
        sampler.attach();

        let resolution = format.resolution();
        self.built_resolution = Some(resolution);
        self.negotiated = Some(capability);
        Ok(resolution)
    }

    pub fn run(&mut self) -> CaptureResult<()> {
        match self.state {
            GraphState::Running => Ok(()),
            GraphState::Closed => Err(CaptureError::invalid_state(self.state, "graph is not built")),
            GraphState::Built => {
                let native = self
                    .native
                    .as_mut()
                    .ok_or_else(|| CaptureError::invalid_state(self.state, "no native graph"))?;
                native.run().map_err(|e| CaptureError::backend("run graph", e))?;
                self.state = GraphState::Running;
                info!("Capture graph running");
                Ok(())
            }
        }
    }

    /// Stop the pipeline. Valid while built or running; the native stop is
    /// forwarded in both.
    pub fn stop(&mut self) -> CaptureResult<()> {
        if !self.state.is_built() {
            return Err(CaptureError::invalid_state(self.state, "graph is not built"));
        }
        if let Some(native) = self.native.as_mut() {
            native.stop().map_err(|e| CaptureError::backend("stop graph", e))?;
        }
        if self.state == GraphState::Running {
            self.state = GraphState::Built;
            info!("Capture graph stopped");
        }
        Ok(())
    }

    /// Stop, dispose the sampler and release the native graph. Safe in any
    /// state and on partially built graphs; never fails.
    pub fn close_all(&mut self) {
        if self.state == GraphState::Running {
            if let Some(native) = self.native.as_mut() {
                if let Err(e) = native.stop() {
                    warn!("Stopping graph during close failed: {:#}", e);
                }
            }
        }
        if let Some(sampler) = self.sampler.take() {
            sampler.dispose();
            let stats = sampler.stats();
            debug!("Sampler released: {} delivered, {} dropped", stats.delivered, stats.dropped);
        }
        if let Some(mut native) = self.native.take() {
            if let Err(e) = native.teardown() {
                warn!("Graph teardown failed: {:#}", e);
            }
            debug!("Native graph released");
        }
        self.built_resolution = None;
        self.negotiated = None;
        self.inputs.clear();
        self.state = GraphState::Closed;
    }
}

impl<B: MediaBackend> Drop for CaptureGraph<B> {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
