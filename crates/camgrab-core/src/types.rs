use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Pixel dimensions of a capture format.
///
/// Ordering is lexicographic (width, then height) and only exists so lists can
/// be de-duplicated and sorted for display; it says nothing about which
/// resolution is "bigger".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Self = Self { width: 640, height: 480 };
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - ResolutionList

/// Distinct resolutions in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionList(Vec<Resolution>);

impl ResolutionList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends `resolution` unless it is already present. Returns `true` when added.
    pub fn add_if_new(&mut self, resolution: Resolution) -> bool {
        if self.0.contains(&resolution) {
            return false;
        }
        self.0.push(resolution);
        true
    }

    pub fn contains(&self, resolution: &Resolution) -> bool {
        self.0.contains(resolution)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resolution> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Resolution] {
        &self.0
    }
}

impl FromIterator<Resolution> for ResolutionList {
    fn from_iter<I: IntoIterator<Item = Resolution>>(iter: I) -> Self {
        let mut list = Self::new();
        for resolution in iter {
            list.add_if_new(resolution);
        }
        list
    }
}

impl IntoIterator for ResolutionList {
    type Item = Resolution;
    type IntoIter = std::vec::IntoIter<Resolution>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResolutionList {
    type Item = &'a Resolution;
    type IntoIter = std::slice::Iter<'a, Resolution>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// MARK: - ColorSubtype

/// Pixel layout a device reports for one of its stream formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSubtype {
    Rgb32,
    Argb32,
    Rgb24,
    /// 16-bit RGB, either 5-6-5 or 5-5-5.
    Rgb16,
    Yuy2,
    Uyvy,
    Nv12,
    I420,
    Mjpeg,
    Unknown,
}

impl ColorSubtype {
    pub fn is_rgb(&self) -> bool {
        matches!(self, Self::Rgb32 | Self::Argb32 | Self::Rgb24 | Self::Rgb16)
    }
}

impl std::fmt::Display for ColorSubtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rgb32 => "RGB32",
            Self::Argb32 => "ARGB32",
            Self::Rgb24 => "RGB24",
            Self::Rgb16 => "RGB16",
            Self::Yuy2 => "YUY2",
            Self::Uyvy => "UYVY",
            Self::Nv12 => "NV12",
            Self::I420 => "I420",
            Self::Mjpeg => "MJPG",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// MARK: - FormatCapability

/// One stream format a device can produce, as reported at `index` in the
/// device's capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatCapability {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u16,
    pub subtype: ColorSubtype,
    pub index: usize,
}

impl FormatCapability {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl std::fmt::Display for FormatCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {}×{} {}bpp {}",
            self.index, self.width, self.height, self.bits_per_pixel, self.subtype
        )
    }
}

// MARK: - ConnectorType

/// Physical video connector behind an input-router (crossbar) pin.
///
/// Discriminants follow the DirectShow `PhysicalConnectorType` values so
/// native adapters can convert with [`ConnectorType::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorType {
    Tuner = 1,
    Composite = 2,
    SVideo = 3,
    Rgb = 4,
    Component = 5,
    SerialDigital = 6,
    ParallelDigital = 7,
    Scsi = 8,
    Aux = 9,
    Ieee1394 = 10,
    Usb = 11,
    VideoDecoder = 12,
    VideoEncoder = 13,
    Scart = 14,
    Black = 15,
}

impl ConnectorType {
    /// Maps a raw connector code; audio connectors (0x1000 and up) and unknown
    /// values yield `None`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Self::Tuner,
            2 => Self::Composite,
            3 => Self::SVideo,
            4 => Self::Rgb,
            5 => Self::Component,
            6 => Self::SerialDigital,
            7 => Self::ParallelDigital,
            8 => Self::Scsi,
            9 => Self::Aux,
            10 => Self::Ieee1394,
            11 => Self::Usb,
            12 => Self::VideoDecoder,
            13 => Self::VideoEncoder,
            14 => Self::Scart,
            15 => Self::Black,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

// MARK: - VideoInput

/// Input selection on the router stage in front of a capture source.
///
/// `index` counts inputs of the same connector type, so the second composite
/// input is `{ connector: Composite, index: 1 }` whatever its pin number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum VideoInput {
    /// Leave the router on whatever input the driver selected.
    #[default]
    Default,
    Connector { connector: ConnectorType, index: u32 },
}

impl VideoInput {
    pub fn new(connector: ConnectorType, index: u32) -> Self {
        Self::Connector { connector, index }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

// MARK: - GraphState

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphState {
    #[default]
    Closed,
    Built,
    Running,
}

impl GraphState {
    /// `Built` and `Running` both own a frame sampler.
    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built | Self::Running)
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Built => write!(f, "built"),
            Self::Running => write!(f, "running"),
        }
    }
}

// MARK: - Rotation

/// Rotate/flip applied to converted frames. Rotations are clockwise; the
/// `FlipX` variants mirror horizontally after rotating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
    FlipX,
    Cw90FlipX,
    /// Same as `Cw180FlipX`.
    FlipY,
    Cw270FlipX,
}

impl Rotation {
    /// Whether output width and height are swapped relative to the input.
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270 | Self::Cw90FlipX | Self::Cw270FlipX)
    }
}

impl std::str::FromStr for Rotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "cw90" | "90" => Ok(Self::Cw90),
            "cw180" | "180" => Ok(Self::Cw180),
            "cw270" | "270" => Ok(Self::Cw270),
            "flip-x" | "flipx" => Ok(Self::FlipX),
            "cw90-flip-x" => Ok(Self::Cw90FlipX),
            "flip-y" | "flipy" => Ok(Self::FlipY),
            "cw270-flip-x" => Ok(Self::Cw270FlipX),
            other => Err(format!("unknown rotation '{other}'")),
        }
    }
}

// MARK: - SampleFormat

/// Format negotiated on the frame sampler's input pin.
///
/// Raw buffers use Windows DIB byte order: 24 bpp is B,G,R; 32 bpp is B,G,R,X;
/// 48 bpp is B,G,R with 16-bit little-endian channels. `bottom_up` buffers
/// store the last image row first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFormat {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u16,
    pub bottom_up: bool,
}

impl SampleFormat {
    pub fn new(width: u32, height: u32, bits_per_pixel: u16) -> Self {
        Self { width, height, bits_per_pixel, bottom_up: false }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    /// Exact byte size of one frame, `None` on overflow.
    pub fn frame_len(&self) -> Option<usize> {
        self.bytes_per_pixel()
            .checked_mul(self.width as usize)?
            .checked_mul(self.height as usize)
    }
}

// MARK: - DeliveryMode

/// How the frame sampler hands frames to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Convert every frame on the capture thread and pass it to a callback.
    Push,
    /// Keep only the latest raw frame until the consumer asks for it.
    #[default]
    Pull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_if_new_is_idempotent() {
        let mut list = ResolutionList::new();
        assert!(list.add_if_new(Resolution::VGA));
        assert!(!list.add_if_new(Resolution::new(640, 480)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn resolution_list_keeps_first_seen_order() {
        let list: ResolutionList = [Resolution::HD, Resolution::VGA, Resolution::HD, Resolution::FHD]
            .into_iter()
            .collect();
        assert_eq!(list.as_slice(), &[Resolution::HD, Resolution::VGA, Resolution::FHD]);
    }

    #[test]
    fn connector_raw_codes() {
        assert_eq!(ConnectorType::from_raw(2), Some(ConnectorType::Composite));
        assert_eq!(ConnectorType::from_raw(15), Some(ConnectorType::Black));
        assert_eq!(ConnectorType::SVideo.as_raw(), 3);
        // PhysConn_Audio_Tuner
        assert_eq!(ConnectorType::from_raw(0x1000), None);
        assert_eq!(ConnectorType::from_raw(0), None);
    }

    #[test]
    fn video_input_serde() {
        let input = VideoInput::new(ConnectorType::SVideo, 1);
        let json = serde_json::to_string(&input).unwrap();
        assert_eq!(json, r#"{"kind":"connector","connector":"s-video","index":1}"#);
        let back: VideoInput = serde_json::from_str(r#"{"kind":"default"}"#).unwrap();
        assert!(back.is_default());
    }

    #[test]
    fn frame_len_matches_dib_size() {
        assert_eq!(SampleFormat::new(640, 480, 24).frame_len(), Some(640 * 480 * 3));
        assert_eq!(SampleFormat::new(2, 2, 48).frame_len(), Some(24));
        assert!(SampleFormat::new(u32::MAX, u32::MAX, 32).frame_len().is_none());
    }

    #[test]
    fn rotation_parses_cli_spellings() {
        assert_eq!("90".parse::<Rotation>(), Ok(Rotation::Cw90));
        assert_eq!("flip-y".parse::<Rotation>(), Ok(Rotation::FlipY));
        assert!("sideways".parse::<Rotation>().is_err());
        assert!(Rotation::Cw270FlipX.swaps_axes());
        assert!(!Rotation::FlipY.swaps_axes());
    }

    #[test]
    fn graph_state_built_covers_running() {
        assert!(GraphState::Running.is_built());
        assert!(GraphState::Built.is_built());
        assert!(!GraphState::Closed.is_built());
    }
}
