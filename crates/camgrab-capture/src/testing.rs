//! Scripted backend for graph and session tests.

use std::sync::Arc;

use anyhow::{bail, Result};
use camgrab_core::{ColorSubtype, ConnectorType, FormatCapability, SampleFormat};
use parking_lot::Mutex;

use crate::device::{DeviceHandle, MediaBackend};
use crate::graph::NativeGraph;
use crate::negotiate::FormatSource;
use crate::sampler::FrameSampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    CreateGraph,
    AddSource,
    Router,
    Route,
    AddSampler,
    Connect,
    Stop,
}

#[derive(Default)]
struct Script {
    events: Vec<String>,
    last_sampler: Option<Arc<FrameSampler>>,
}

/// Device with `[(640,480,16,YUY2), (640,480,24,RGB24), (1280,720,24,RGB24)]`
/// behind a `[Composite, SVideo]` router. Every native call is recorded.
pub(crate) struct FakeBackend {
    caps: Vec<FormatCapability>,
    router: Option<Vec<ConnectorType>>,
    fail_at: Option<Stage>,
    script: Arc<Mutex<Script>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        let cap = |index, width, height, bits_per_pixel, subtype| FormatCapability {
            width,
            height,
            bits_per_pixel,
            subtype,
            index,
        };
        Self {
            caps: vec![
                cap(0, 640, 480, 16, ColorSubtype::Yuy2),
                cap(1, 640, 480, 24, ColorSubtype::Rgb24),
                cap(2, 1280, 720, 24, ColorSubtype::Rgb24),
            ],
            router: Some(vec![ConnectorType::Composite, ConnectorType::SVideo]),
            fail_at: None,
            script: Arc::default(),
        }
    }

    pub(crate) fn failing_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub(crate) fn without_router(mut self) -> Self {
        self.router = None;
        self
    }

    pub(crate) fn handle(&self) -> DeviceHandle<()> {
        DeviceHandle::new("Fake Camera", "fake://0", ())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.script.lock().events.clone()
    }

    pub(crate) fn last_sampler(&self) -> Option<Arc<FrameSampler>> {
        self.script.lock().last_sampler.clone()
    }
}

impl MediaBackend for FakeBackend {
    type Device = ();
    type Graph = FakeGraph;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle<()>>> {
        Ok(vec![self.handle()])
    }

    fn create_graph(&self) -> Result<FakeGraph> {
        if self.fail_at == Some(Stage::CreateGraph) {
            bail!("CoCreateInstance(FilterGraph) failed");
        }
        self.script.lock().events.push("create".into());
        Ok(FakeGraph {
            caps: self.caps.clone(),
            router: self.router.clone(),
            fail_at: self.fail_at,
            script: Arc::clone(&self.script),
            has_source: false,
            committed: None,
        })
    }
}

pub(crate) struct FakeGraph {
    caps: Vec<FormatCapability>,
    router: Option<Vec<ConnectorType>>,
    fail_at: Option<Stage>,
    script: Arc<Mutex<Script>>,
    has_source: bool,
    committed: Option<FormatCapability>,
}

impl FakeGraph {
    fn step(&self, stage: Stage, event: String) -> Result<()> {
        if self.fail_at == Some(stage) {
            bail!("{:?} failed", stage);
        }
        self.script.lock().events.push(event);
        Ok(())
    }
}

impl FormatSource for FakeGraph {
    fn capability_count(&self) -> Result<usize> {
        if !self.has_source {
            bail!("no source");
        }
        Ok(self.caps.len())
    }

    fn capability(&self, index: usize) -> Result<FormatCapability> {
        self.caps.get(index).copied().ok_or_else(|| anyhow::anyhow!("no capability {index}"))
    }

    fn apply_format(&mut self, capability: &FormatCapability) -> Result<()> {
        self.script.lock().events.push(format!("format {}", capability.index));
        self.committed = Some(*capability);
        Ok(())
    }
}

impl NativeGraph for FakeGraph {
    type Device = ();

    fn add_source(&mut self, _: &()) -> Result<()> {
        self.step(Stage::AddSource, "source".into())?;
        self.has_source = true;
        Ok(())
    }

    fn router_inputs(&mut self) -> Result<Option<Vec<ConnectorType>>> {
        self.step(Stage::Router, "router".into())?;
        Ok(self.router.clone())
    }

    fn route(&mut self, input: usize) -> Result<()> {
        self.step(Stage::Route, format!("route {input}"))
    }

    fn add_sampler(&mut self, sampler: Arc<FrameSampler>) -> Result<()> {
        self.script.lock().last_sampler = Some(sampler);
        self.step(Stage::AddSampler, "sampler".into())
    }

    fn connect(&mut self) -> Result<SampleFormat> {
        self.step(Stage::Connect, "connect".into())?;
        let cap = self.committed.ok_or_else(|| anyhow::anyhow!("no format committed"))?;
        Ok(SampleFormat { bottom_up: true, ..SampleFormat::new(cap.width, cap.height, 24) })
    }

    fn run(&mut self) -> Result<()> {
        self.script.lock().events.push("run".into());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.step(Stage::Stop, "stop".into())
    }

    fn teardown(&mut self) -> Result<()> {
        self.script.lock().events.push("teardown".into());
        Ok(())
    }
}
