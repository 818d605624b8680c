//! Capture device discovery.

use std::sync::Arc;

use anyhow::Result;
use camgrab_core::{CaptureError, CaptureResult};
use tracing::{debug, info};

use crate::graph::NativeGraph;

/// A platform media-graph service.
pub trait MediaBackend {
    /// Native device identity. Shared behind an `Arc` by [`DeviceHandle`].
    type Device;
    type Graph: NativeGraph<Device = Self::Device>;

    /// Short backend name for logs and the CLI.
    fn name(&self) -> &'static str;

    /// Every capture device currently present, in backend order.
    fn enumerate(&self) -> Result<Vec<DeviceHandle<Self::Device>>>;

    /// Fresh, empty processing graph.
    fn create_graph(&self) -> Result<Self::Graph>;
}

/// Opaque handle bound to one physical device. Cloning shares the same
/// device object; it never re-opens the device.
pub struct DeviceHandle<D> {
    name: String,
    path: String,
    device: Arc<D>,
}

impl<D> DeviceHandle<D> {
    pub fn new(name: impl Into<String>, path: impl Into<String>, device: D) -> Self {
        Self { name: name.into(), path: path.into(), device: Arc::new(device) }
    }

    /// Friendly name shown to users.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable backend-specific identifier (device path, monitor id, …).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D> Clone for DeviceHandle<D> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), path: self.path.clone(), device: Arc::clone(&self.device) }
    }
}

impl<D> std::fmt::Debug for DeviceHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

// ── DeviceEnumerator ───────────────────────────────────────────────────────────

pub struct DeviceEnumerator<B: MediaBackend> {
    backend: Arc<B>,
    devices: Vec<DeviceHandle<B::Device>>,
}

impl<B: MediaBackend> DeviceEnumerator<B> {
    /// Creates the enumerator and runs a first [`update_device_list`](Self::update_device_list).
    pub fn new(backend: B) -> CaptureResult<Self> {
        let mut enumerator = Self { backend: Arc::new(backend), devices: Vec::new() };
        enumerator.update_device_list()?;
        Ok(enumerator)
    }

    /// Re-query the backend. Returns the number of devices found.
    pub fn update_device_list(&mut self) -> CaptureResult<usize> {
        let devices = self
            .backend
            .enumerate()
            .map_err(|e| CaptureError::backend("enumerate devices", e))?;
        for (index, device) in devices.iter().enumerate() {
            debug!("Device[{}] '{}' ({})", index, device.name(), device.path());
        }
        info!("{} backend: {} capture device(s)", self.backend.name(), devices.len());
        self.devices = devices;
        Ok(self.devices.len())
    }

    pub fn devices(&self) -> &[DeviceHandle<B::Device>] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> CaptureResult<DeviceHandle<B::Device>> {
        if self.devices.is_empty() {
            return Err(CaptureError::NoDevicesFound);
        }
        self.devices
            .get(index)
            .cloned()
            .ok_or(CaptureError::DeviceNotFound { index, count: self.devices.len() })
    }

    /// First device whose friendly name matches, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<DeviceHandle<B::Device>> {
        self.devices
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::{SyntheticBackend, SyntheticDevice};

    #[test]
    fn empty_backend_reports_no_devices() {
        let enumerator = DeviceEnumerator::new(SyntheticBackend::new(Vec::new())).unwrap();
        assert!(enumerator.devices().is_empty());
        assert!(matches!(enumerator.device(0), Err(CaptureError::NoDevicesFound)));
    }

    #[test]
    fn out_of_range_index_is_device_not_found() {
        let enumerator = DeviceEnumerator::new(SyntheticBackend::default()).unwrap();
        assert!(matches!(
            enumerator.device(3),
            Err(CaptureError::DeviceNotFound { index: 3, count: 1 })
        ));
    }

    #[test]
    fn find_by_name_and_handles_share_device() {
        let backend = SyntheticBackend::new(vec![
            SyntheticDevice::test_pattern(),
            SyntheticDevice { name: "Capture Card".into(), ..SyntheticDevice::test_pattern() },
        ]);
        let mut enumerator = DeviceEnumerator::new(backend).unwrap();
        assert_eq!(enumerator.update_device_list().unwrap(), 2);

        let card = enumerator.find("capture card").expect("found by name");
        assert_eq!(card.name(), "Capture Card");
        let again = enumerator.device(1).unwrap();
        assert!(std::ptr::eq(card.device(), again.device()));
        assert!(enumerator.find("missing").is_none());
    }
}
