//! Format negotiation: pick one of the stream formats a device reports and
//! make it the active one.
//!
//! Policy, first match in device order wins:
//!
//! 1. bit depth, resolution and subtype all match → commit, stop looking
//! 2. bit depth and resolution match → remember the first one as fallback
//! 3. end of list → commit the fallback, or fail with `UnsupportedFormat`

use anyhow::Result;
use camgrab_core::{
    CaptureError, CaptureResult, FormatCapability, FormatPolicy, Resolution, ResolutionList,
    DEFAULT_BIT_DEPTHS,
};
use tracing::{debug, info, warn};

use crate::device::MediaBackend;
use crate::graph::NativeGraph;

/// Capability table of a capture source's output.
///
/// Implemented by the native graph once a source has been added. Each
/// `capability` call returns an owned value; the adapter frees whatever native
/// structure it decoded before returning.
pub trait FormatSource {
    fn capability_count(&self) -> Result<usize>;
    fn capability(&self, index: usize) -> Result<FormatCapability>;
    /// Make `capability` the source's output format.
    fn apply_format(&mut self, capability: &FormatCapability) -> Result<()>;
}

#[derive(Default)]
struct Selection {
    fallback: Option<FormatCapability>,
}

impl Selection {
    /// Returns the capability to commit right away, if `cap` is a full match.
    fn offer(&mut self, cap: FormatCapability, policy: &FormatPolicy) -> Option<FormatCapability> {
        if !(policy.bit_depth_ok(&cap) && policy.resolution_ok(&cap)) {
            return None;
        }
        if policy.subtype_ok(&cap) {
            return Some(cap);
        }
        self.fallback.get_or_insert(cap);
        None
    }

    fn finish(self) -> Option<FormatCapability> {
        self.fallback
    }
}

/// Apply the selection policy to an in-memory capability list.
pub fn choose_format<'a, I>(capabilities: I, policy: &FormatPolicy) -> Option<FormatCapability>
where
    I: IntoIterator<Item = &'a FormatCapability>,
{
    let mut selection = Selection::default();
    for cap in capabilities {
        if let Some(hit) = selection.offer(*cap, policy) {
            return Some(hit);
        }
    }
    selection.finish()
}

/// Probe `source` and commit the best capability as its output format.
///
/// Native failures surface as `GraphConstructionFailed`; this only runs while a
/// graph is being built.
pub fn select_format<S>(source: &mut S, policy: &FormatPolicy) -> CaptureResult<FormatCapability>
where
    S: FormatSource + ?Sized,
{
    let count = source
        .capability_count()
        .map_err(|e| CaptureError::construction("query capabilities", e))?;
    debug!("Negotiating against {} capabilities for {}", count, policy.describe());

    let mut selection = Selection::default();
    let mut chosen = None;
    for index in 0..count {
        let cap = source
            .capability(index)
            .map_err(|e| CaptureError::construction("query capabilities", e))?;
        if let Some(hit) = selection.offer(cap, policy) {
            chosen = Some(hit);
            break;
        }
    }

    let Some(cap) = chosen.or_else(|| selection.finish()) else {
        return Err(CaptureError::UnsupportedFormat { requested: policy.describe() });
    };
    source
        .apply_format(&cap)
        .map_err(|e| CaptureError::construction("set format", e))?;
    info!("Negotiated format {}", cap);
    Ok(cap)
}

/// Distinct resolutions offered at 16, 24 or 32 bits per pixel.
pub fn list_resolutions<S>(source: &S) -> CaptureResult<ResolutionList>
where
    S: FormatSource + ?Sized,
{
    let count = source
        .capability_count()
        .map_err(|e| CaptureError::backend("query capabilities", e))?;
    let mut list = ResolutionList::new();
    for index in 0..count {
        let cap = source
            .capability(index)
            .map_err(|e| CaptureError::backend("query capabilities", e))?;
        if DEFAULT_BIT_DEPTHS.contains(&cap.bits_per_pixel) {
            list.add_if_new(cap.resolution());
        }
    }
    Ok(list)
}

/// List a device's resolutions through a throwaway graph holding only the
/// source stage.
pub fn probe_resolutions<B: MediaBackend>(backend: &B, device: &B::Device) -> CaptureResult<ResolutionList> {
    let mut graph = backend
        .create_graph()
        .map_err(|e| CaptureError::backend("create graph", e))?;
    let listed = graph
        .add_source(device)
        .map_err(|e| CaptureError::backend("add source", e))
        .and_then(|()| list_resolutions(&graph));
    if let Err(e) = graph.teardown() {
        warn!("Probe graph teardown failed: {:#}", e);
    }
    listed
}

/// Smallest listed resolution covering at least `wanted` pixels, else the largest.
pub fn nearest_resolution(list: &ResolutionList, wanted: Resolution) -> Option<Resolution> {
    let target = wanted.total_pixels();
    list.iter()
        .copied()
        .filter(|r| r.total_pixels() >= target)
        .min_by_key(|r| r.total_pixels())
        .or_else(|| list.iter().copied().max_by_key(|r| r.total_pixels()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camgrab_core::ColorSubtype;
    use std::cell::Cell;

    fn cap(index: usize, width: u32, height: u32, bpp: u16, subtype: ColorSubtype) -> FormatCapability {
        FormatCapability { width, height, bits_per_pixel: bpp, subtype, index }
    }

    fn sample_caps() -> Vec<FormatCapability> {
        vec![
            cap(0, 640, 480, 16, ColorSubtype::Yuy2),
            cap(1, 640, 480, 24, ColorSubtype::Rgb24),
            cap(2, 1280, 720, 24, ColorSubtype::Rgb24),
        ]
    }

    fn rgb24_first(resolution: Resolution) -> FormatPolicy {
        FormatPolicy {
            preferred_subtypes: vec![ColorSubtype::Rgb24, ColorSubtype::Rgb32],
            ..FormatPolicy::default()
        }
        .with_resolution(Some(resolution))
    }

    /// Counts probes and records the committed format.
    struct CountingSource {
        caps: Vec<FormatCapability>,
        probes: Cell<usize>,
        applied: Option<FormatCapability>,
    }

    impl CountingSource {
        fn new(caps: Vec<FormatCapability>) -> Self {
            Self { caps, probes: Cell::new(0), applied: None }
        }
    }

    impl FormatSource for CountingSource {
        fn capability_count(&self) -> Result<usize> {
            Ok(self.caps.len())
        }

        fn capability(&self, index: usize) -> Result<FormatCapability> {
            self.probes.set(self.probes.get() + 1);
            Ok(self.caps[index])
        }

        fn apply_format(&mut self, capability: &FormatCapability) -> Result<()> {
            self.applied = Some(*capability);
            Ok(())
        }
    }

    #[test]
    fn full_match_commits_and_stops_early() {
        let mut source = CountingSource::new(sample_caps());
        let chosen = select_format(&mut source, &rgb24_first(Resolution::VGA)).unwrap();

        assert_eq!(chosen, sample_caps()[1]);
        assert_eq!(source.applied, Some(sample_caps()[1]));
        assert_eq!(source.probes.get(), 2);
    }

    #[test]
    fn no_depth_and_resolution_match_is_unsupported() {
        let mut source = CountingSource::new(sample_caps());
        let err = select_format(&mut source, &rgb24_first(Resolution::FHD)).unwrap_err();

        assert!(matches!(err, CaptureError::UnsupportedFormat { .. }));
        assert!(source.applied.is_none());
        assert_eq!(source.probes.get(), 3);
    }

    #[test]
    fn fallback_is_first_depth_and_resolution_match() {
        let caps = vec![
            // preferred subtype, wrong resolution
            cap(0, 1280, 720, 24, ColorSubtype::Rgb24),
            cap(1, 640, 480, 16, ColorSubtype::Yuy2),
            cap(2, 640, 480, 16, ColorSubtype::Uyvy),
        ];
        let policy = rgb24_first(Resolution::VGA);

        assert_eq!(choose_format(&caps, &policy), Some(caps[1]));
    }

    #[test]
    fn first_full_match_wins_over_later_ones() {
        let caps = vec![
            cap(0, 640, 480, 32, ColorSubtype::Mjpeg),
            cap(1, 640, 480, 32, ColorSubtype::Rgb32),
            cap(2, 640, 480, 24, ColorSubtype::Rgb24),
        ];
        assert_eq!(choose_format(&caps, &rgb24_first(Resolution::VGA)), Some(caps[1]));
    }

    #[test]
    fn unset_resolution_is_a_wildcard() {
        let policy = FormatPolicy {
            bit_depths: vec![24],
            ..FormatPolicy::default()
        };
        assert_eq!(choose_format(&sample_caps(), &policy), Some(sample_caps()[1]));
    }

    #[test]
    fn probe_failure_is_construction_error() {
        struct Broken;
        impl FormatSource for Broken {
            fn capability_count(&self) -> Result<usize> {
                Ok(1)
            }
            fn capability(&self, _: usize) -> Result<FormatCapability> {
                anyhow::bail!("GetStreamCaps failed")
            }
            fn apply_format(&mut self, _: &FormatCapability) -> Result<()> {
                Ok(())
            }
        }

        let err = select_format(&mut Broken, &FormatPolicy::default()).unwrap_err();
        assert!(matches!(err, CaptureError::GraphConstructionFailed { stage: "query capabilities", .. }));
    }

    #[test]
    fn resolutions_skip_other_depths_and_duplicates() {
        let mut caps = sample_caps();
        caps.push(cap(3, 1920, 1080, 12, ColorSubtype::Nv12));
        caps.push(cap(4, 1280, 720, 32, ColorSubtype::Rgb32));
        let source = CountingSource::new(caps);

        let list = list_resolutions(&source).unwrap();
        assert_eq!(list.as_slice(), &[Resolution::VGA, Resolution::HD]);
    }

    #[test]
    fn nearest_prefers_smallest_covering() {
        let list: ResolutionList = [Resolution::HD, Resolution::VGA, Resolution::FHD].into_iter().collect();
        assert_eq!(nearest_resolution(&list, Resolution::new(800, 600)), Some(Resolution::HD));
        assert_eq!(nearest_resolution(&list, Resolution::new(4096, 2160)), Some(Resolution::FHD));
        assert_eq!(nearest_resolution(&ResolutionList::new(), Resolution::VGA), None);
    }
}
