//! Capture session facade: one device, one graph, one open/build/run/snapshot/close
//! lifecycle.

use std::sync::Arc;

use camgrab_core::{
    CaptureConfig, CaptureError, CaptureResult, DeliveryMode, FormatPolicy, GraphState,
    Resolution, ResolutionList, Rotation, VideoInput,
};
use image::RgbImage;
use tracing::info;

use crate::device::{DeviceHandle, MediaBackend};
use crate::graph::CaptureGraph;
use crate::negotiate;
use crate::sampler::{FrameDelivery, SamplerStats};

pub struct CaptureSession<B: MediaBackend> {
    graph: CaptureGraph<B>,
    device: Option<DeviceHandle<B::Device>>,
}

impl<B: MediaBackend> CaptureSession<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { graph: CaptureGraph::new(backend), device: None }
    }

    /// Bind the session to `device`. Only while closed.
    pub fn open(&mut self, device: DeviceHandle<B::Device>) -> CaptureResult<()> {
        self.require_closed("close the session before opening another device")?;
        info!("Opened capture device '{}'", device.name());
        self.device = Some(device);
        Ok(())
    }

    pub fn device(&self) -> Option<&DeviceHandle<B::Device>> {
        self.device.as_ref()
    }

    pub fn set_resolution(&mut self, resolution: Resolution) -> CaptureResult<()> {
        self.graph.change_resolution(resolution)
    }

    pub fn set_video_input(&mut self, input: VideoInput) -> CaptureResult<()> {
        self.graph.set_video_input(input)
    }

    pub fn set_policy(&mut self, policy: FormatPolicy) -> CaptureResult<()> {
        self.graph.set_policy(policy)
    }

    /// Copy resolution, negotiation policy and video input from `config`.
    pub fn apply_config(&mut self, config: &CaptureConfig) -> CaptureResult<()> {
        config.validate()?;
        self.require_closed("configuration is fixed once the graph is built")?;
        self.graph.set_policy(config.policy())?;
        if let Some(resolution) = config.resolution {
            self.graph.change_resolution(resolution)?;
        }
        self.graph.set_video_input(config.video_input)
    }

    /// Build the graph on the opened device. Returns the negotiated resolution.
    pub fn build_graph(&mut self, delivery: FrameDelivery, rotation: Rotation) -> CaptureResult<Resolution> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CaptureError::invalid_state(self.graph.state(), "no device opened"))?;
        self.graph.build(device, delivery, rotation)
    }

    pub fn run(&mut self) -> CaptureResult<()> {
        self.graph.run()
    }

    pub fn stop(&mut self) -> CaptureResult<()> {
        self.graph.stop()
    }

    /// Latest frame as RGB, rotated. Needs a pull-mode graph.
    pub fn snapshot_next_frame(&self, rotation: Rotation) -> CaptureResult<RgbImage> {
        let state = self.graph.state();
        let sampler = self
            .graph
            .sampler()
            .ok_or_else(|| CaptureError::invalid_state(state, "graph is not built"))?;
        if sampler.mode() != DeliveryMode::Pull {
            return Err(CaptureError::invalid_state(state, "snapshots need pull delivery"));
        }
        sampler.snapshot_next_frame(rotation)
    }

    /// Resolutions the opened device offers at 16, 24 or 32 bpp. Uses the live
    /// graph when built, a throwaway one otherwise.
    pub fn list_resolutions(&self) -> CaptureResult<ResolutionList> {
        if let Some(native) = self.graph.native() {
            return negotiate::list_resolutions(native);
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CaptureError::invalid_state(self.graph.state(), "no device opened"))?;
        negotiate::probe_resolutions(self.graph.backend().as_ref(), device.device())
    }

    pub fn video_inputs(&self) -> &[VideoInput] {
        self.graph.video_inputs()
    }

    /// Whether a sampler is attached to a connected pipeline.
    pub fn ready(&self) -> bool {
        self.graph.sampler().is_some_and(|s| s.ready())
    }

    pub fn state(&self) -> GraphState {
        self.graph.state()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.graph.resolution()
    }

    pub fn stats(&self) -> Option<SamplerStats> {
        self.graph.sampler().map(|s| s.stats())
    }

    /// Release the graph and the device. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        self.graph.close_all();
        if let Some(device) = self.device.take() {
            info!("Closed capture device '{}'", device.name());
        }
    }

    fn require_closed(&self, reason: &str) -> CaptureResult<()> {
        match self.graph.state() {
            GraphState::Closed => Ok(()),
            state => Err(CaptureError::invalid_state(state, reason)),
        }
    }
}

impl<B: MediaBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::SyntheticBackend;
    use crate::device::DeviceEnumerator;
    use crate::testing::FakeBackend;
    use camgrab_core::ConnectorType;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn synthetic_session() -> CaptureSession<SyntheticBackend> {
        let enumerator = DeviceEnumerator::new(SyntheticBackend::default()).unwrap();
        let mut session = CaptureSession::new(Arc::clone(enumerator.backend()));
        session.open(enumerator.device(0).unwrap()).unwrap();
        session
    }

    fn wait_for_frame(session: &CaptureSession<SyntheticBackend>, rotation: Rotation) -> RgbImage {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match session.snapshot_next_frame(rotation) {
                Ok(image) => return image,
                Err(CaptureError::NoFrameAvailable) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("no frame: {e}"),
            }
        }
    }

    #[test]
    fn pull_session_end_to_end() {
        let mut session = synthetic_session();
        session.set_resolution(Resolution::VGA).unwrap();

        let res = session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
        assert_eq!(res, Resolution::VGA);
        assert!(session.ready());
        assert!(matches!(
            session.snapshot_next_frame(Rotation::None),
            Err(CaptureError::NoFrameAvailable)
        ));

        session.run().unwrap();
        let frame = wait_for_frame(&session, Rotation::Cw90);
        assert_eq!(frame.dimensions(), (480, 640));

        session.stop().unwrap();
        assert_eq!(session.state(), GraphState::Built);
        session.close();
        assert_eq!(session.state(), GraphState::Closed);
        assert!(!session.ready());
        assert!(session.device().is_none());
    }

    #[test]
    fn push_session_delivers_rotated_frames() {
        let mut session = synthetic_session();
        session.set_resolution(Resolution::new(320, 240)).unwrap();

        let (tx, rx) = mpsc::channel();
        session
            .build_graph(
                FrameDelivery::push(move |image| {
                    let _ = tx.send(image);
                }),
                Rotation::Cw270,
            )
            .unwrap();
        session.run().unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(5)).expect("pushed frame");
        assert_eq!(frame.dimensions(), (240, 320));
        assert!(matches!(
            session.snapshot_next_frame(Rotation::None),
            Err(CaptureError::InvalidStateTransition { .. })
        ));
        session.close();
    }

    #[test]
    fn resolution_locked_while_built() {
        let mut session = synthetic_session();
        session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
        assert!(matches!(
            session.set_resolution(Resolution::HD),
            Err(CaptureError::InvalidStateTransition { .. })
        ));
        let other = session.device().cloned().unwrap();
        assert!(session.open(other).is_err());
    }

    #[test]
    fn list_resolutions_before_and_after_build() {
        let mut session = synthetic_session();
        let probed = session.list_resolutions().unwrap();
        assert_eq!(
            probed.as_slice(),
            &[Resolution::VGA, Resolution::HD, Resolution::new(320, 240)]
        );

        session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
        assert_eq!(session.list_resolutions().unwrap(), probed);
    }

    #[test]
    fn build_without_device_fails() {
        let mut session = CaptureSession::new(Arc::new(SyntheticBackend::default()));
        assert!(matches!(
            session.build_graph(FrameDelivery::Pull, Rotation::None),
            Err(CaptureError::InvalidStateTransition { .. })
        ));
        assert!(session.list_resolutions().is_err());
    }

    #[test]
    fn config_selects_resolution_and_input() {
        let mut session = synthetic_session();
        let config = CaptureConfig::from_json_str(
            r#"{"resolution": {"width": 1280, "height": 720},
                "videoInput": {"kind": "connector", "connector": "s-video", "index": 0}}"#,
        )
        .unwrap();
        session.apply_config(&config).unwrap();

        let res = session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
        assert_eq!(res, Resolution::HD);
        assert_eq!(
            session.video_inputs(),
            &[
                VideoInput::new(ConnectorType::Composite, 0),
                VideoInput::new(ConnectorType::SVideo, 0)
            ]
        );
    }

    #[test]
    fn partial_policy_negotiates_on_pinned_dimension() {
        let mut session = synthetic_session();
        session
            .set_policy(FormatPolicy { width: Some(1280), ..FormatPolicy::default() })
            .unwrap();
        assert_eq!(session.resolution(), None);

        let res = session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
        assert_eq!(res, Resolution::HD);
        assert_eq!(session.resolution(), Some(Resolution::HD));

        session.close();
        assert_eq!(session.resolution(), None);
    }

    #[test]
    fn snapshot_before_build_is_invalid() {
        let session = synthetic_session();
        assert!(matches!(
            session.snapshot_next_frame(Rotation::None),
            Err(CaptureError::InvalidStateTransition { state: GraphState::Closed, .. })
        ));
    }

    #[test]
    fn failed_build_leaves_session_closed() {
        let mut session = synthetic_session();
        session.set_resolution(Resolution::FHD).unwrap();
        assert!(matches!(
            session.build_graph(FrameDelivery::Pull, Rotation::None),
            Err(CaptureError::UnsupportedFormat { .. })
        ));
        assert_eq!(session.state(), GraphState::Closed);
        assert!(session.stats().is_none());

        session.set_resolution(Resolution::VGA).unwrap();
        session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
    }

    #[test]
    fn close_on_drop_tears_down_once() {
        let backend = Arc::new(FakeBackend::new());
        {
            let mut session = CaptureSession::new(Arc::clone(&backend));
            session.open(backend.handle()).unwrap();
            session.build_graph(FrameDelivery::Pull, Rotation::None).unwrap();
            session.run().unwrap();
            session.close();
        }
        let events = backend.events();
        assert_eq!(events.iter().filter(|e| *e == "teardown").count(), 1);
        assert!(backend.last_sampler().is_some_and(|s| s.is_disposed()));
    }
}
