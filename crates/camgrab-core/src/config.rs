use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{CaptureError, CaptureResult};
use crate::types::{ColorSubtype, DeliveryMode, FormatCapability, Resolution, Rotation, VideoInput};

/// Bit depths accepted when nothing else is configured.
pub const DEFAULT_BIT_DEPTHS: [u16; 3] = [16, 24, 32];

/// Colour subtypes preferred when nothing else is configured, best first.
pub const DEFAULT_SUBTYPES: [ColorSubtype; 5] = [
    ColorSubtype::Rgb32,
    ColorSubtype::Argb32,
    ColorSubtype::Rgb24,
    ColorSubtype::Rgb16,
    ColorSubtype::Yuy2,
];

// MARK: - FormatPolicy

/// What the format negotiator is looking for. A `None` dimension matches any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPolicy {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_depths: Vec<u16>,
    pub preferred_subtypes: Vec<ColorSubtype>,
}

impl Default for FormatPolicy {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            bit_depths: DEFAULT_BIT_DEPTHS.to_vec(),
            preferred_subtypes: DEFAULT_SUBTYPES.to_vec(),
        }
    }
}

impl FormatPolicy {
    /// Same depths and subtypes, pinned to `resolution` (or unpinned for `None`).
    pub fn with_resolution(&self, resolution: Option<Resolution>) -> Self {
        Self {
            width: resolution.map(|r| r.width),
            height: resolution.map(|r| r.height),
            ..self.clone()
        }
    }

    pub fn bit_depth_ok(&self, capability: &FormatCapability) -> bool {
        self.bit_depths.contains(&capability.bits_per_pixel)
    }

    pub fn subtype_ok(&self, capability: &FormatCapability) -> bool {
        self.preferred_subtypes.contains(&capability.subtype)
    }

    pub fn resolution_ok(&self, capability: &FormatCapability) -> bool {
        self.width.map_or(true, |w| w == capability.width)
            && self.height.map_or(true, |h| h == capability.height)
    }

    /// Human-readable description used in `UnsupportedFormat` errors.
    pub fn describe(&self) -> String {
        let dim = |d: Option<u32>| d.map_or_else(|| "*".to_owned(), |v| v.to_string());
        format!("{}×{} at {:?} bpp", dim(self.width), dim(self.height), self.bit_depths)
    }
}

// MARK: - CaptureConfig

/// Capture session configuration, usually loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    #[serde(alias = "deviceIndex")]
    pub device_index: usize,
    /// Friendly name; takes precedence over `device_index` when set.
    #[serde(alias = "deviceName")]
    pub device_name: Option<String>,
    pub resolution: Option<Resolution>,
    #[serde(alias = "bitDepths")]
    pub bit_depths: Vec<u16>,
    #[serde(alias = "preferredSubtypes")]
    pub preferred_subtypes: Vec<ColorSubtype>,
    #[serde(alias = "videoInput")]
    pub video_input: VideoInput,
    pub rotation: Rotation,
    pub mode: DeliveryMode,
    /// Poll interval for pull-mode snapshots.
    #[serde(alias = "intervalMs")]
    pub interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            device_name: None,
            resolution: None,
            bit_depths: DEFAULT_BIT_DEPTHS.to_vec(),
            preferred_subtypes: DEFAULT_SUBTYPES.to_vec(),
            video_input: VideoInput::Default,
            rotation: Rotation::None,
            mode: DeliveryMode::Pull,
            interval_ms: 100,
        }
    }
}

impl CaptureConfig {
    pub fn from_json_str(json: &str) -> CaptureResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!("Loaded capture config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.bit_depths.is_empty() {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "bit_depths must list at least one depth".into(),
            });
        }
        if let Some(res) = self.resolution {
            if res.width == 0 || res.height == 0 {
                return Err(CaptureError::ConfigurationInvalid {
                    reason: format!("resolution {res} has a zero dimension"),
                });
            }
        }
        if self.interval_ms == 0 {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "interval_ms must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn policy(&self) -> FormatPolicy {
        FormatPolicy {
            width: None,
            height: None,
            bit_depths: self.bit_depths.clone(),
            preferred_subtypes: self.preferred_subtypes.clone(),
        }
        .with_resolution(self.resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectorType;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "deviceIndex": 2,
            "resolution": {"width": 1280, "height": 720},
            "bitDepths": [24],
            "preferredSubtypes": ["rgb24", "yuy2"],
            "videoInput": {"kind": "connector", "connector": "composite", "index": 0},
            "rotation": "cw90",
            "mode": "push",
            "intervalMs": 40
        }"#;

        let cfg = CaptureConfig::from_json_str(json).expect("valid camelCase config");
        assert_eq!(cfg.device_index, 2);
        assert_eq!(cfg.resolution, Some(Resolution::HD));
        assert_eq!(cfg.bit_depths, vec![24]);
        assert_eq!(cfg.video_input, VideoInput::new(ConnectorType::Composite, 0));
        assert_eq!(cfg.rotation, Rotation::Cw90);
        assert_eq!(cfg.mode, DeliveryMode::Push);
        assert_eq!(cfg.interval_ms, 40);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = CaptureConfig::from_json_str(r#"{"device_name": "USB Camera"}"#).unwrap();
        assert_eq!(cfg.device_name.as_deref(), Some("USB Camera"));
        assert_eq!(cfg.bit_depths, DEFAULT_BIT_DEPTHS.to_vec());
        assert_eq!(cfg.preferred_subtypes, DEFAULT_SUBTYPES.to_vec());
        assert_eq!(cfg.mode, DeliveryMode::Pull);
        assert!(cfg.resolution.is_none());
    }

    #[test]
    fn rejects_empty_bit_depths() {
        let err = CaptureConfig::from_json_str(r#"{"bit_depths": []}"#).unwrap_err();
        assert!(matches!(err, CaptureError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn rejects_zero_dimension() {
        let err = CaptureConfig::from_json_str(r#"{"resolution": {"width": 0, "height": 480}}"#)
            .unwrap_err();
        assert!(matches!(err, CaptureError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, r#"{"resolution": {"width": 640, "height": 480}}"#).unwrap();

        let cfg = CaptureConfig::load(&path).unwrap();
        let policy = cfg.policy();
        assert_eq!(policy.width, Some(640));
        assert_eq!(policy.height, Some(480));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CaptureConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CaptureError::Io(_)));
    }

    #[test]
    fn policy_wildcards_unset_dimensions() {
        let policy = FormatPolicy { width: Some(640), ..FormatPolicy::default() };
        let cap = FormatCapability {
            width: 640,
            height: 360,
            bits_per_pixel: 24,
            subtype: ColorSubtype::Rgb24,
            index: 0,
        };
        assert!(policy.resolution_ok(&cap));
        assert!(!policy.with_resolution(Some(Resolution::VGA)).resolution_ok(&cap));
        assert!(policy.with_resolution(None).resolution_ok(&cap));
    }
}
