//! `AM_MEDIA_TYPE` ownership and decoding.

use std::mem::ManuallyDrop;

use camgrab_core::{ColorSubtype, FormatCapability, SampleFormat};
use windows::core::GUID;
use windows::Win32::Graphics::Gdi::BITMAPINFOHEADER;
use windows::Win32::Media::MediaFoundation::{AM_MEDIA_TYPE, VIDEOINFOHEADER, VIDEOINFOHEADER2};
use windows::Win32::System::Com::CoTaskMemFree;

// PIN_CATEGORY_CAPTURE: {fb6c4281-0353-11d1-905f-0000c0cc16ba}
pub(super) const PIN_CATEGORY_CAPTURE: GUID = GUID::from_u128(0xfb6c4281_0353_11d1_905f_0000c0cc16ba);

// LOOK_UPSTREAM_ONLY: {ac798be0-98e3-11d1-b3f1-00aa003761c5}
pub(super) const LOOK_UPSTREAM_ONLY: GUID = GUID::from_u128(0xac798be0_98e3_11d1_b3f1_00aa003761c5);

// MEDIATYPE_Video: {73646976-0000-0010-8000-00AA00389B71}
pub(super) const MEDIATYPE_VIDEO: GUID = GUID::from_u128(0x73646976_0000_0010_8000_00aa00389b71);

// FORMAT_VideoInfo: {05589f80-c356-11ce-bf01-00aa0055595a}
pub(super) const FORMAT_VIDEOINFO: GUID = GUID::from_u128(0x05589f80_c356_11ce_bf01_00aa0055595a);

// FORMAT_VideoInfo2: {f72a76a0-eb0a-11d0-ace4-0000c0cc16ba}
const FORMAT_VIDEOINFO2: GUID = GUID::from_u128(0xf72a76a0_eb0a_11d0_ace4_0000c0cc16ba);

pub(super) const MEDIASUBTYPE_RGB24: GUID = GUID::from_u128(0xe436eb7d_524f_11ce_9f53_0020af0ba770);
const MEDIASUBTYPE_RGB32: GUID = GUID::from_u128(0xe436eb7e_524f_11ce_9f53_0020af0ba770);
const MEDIASUBTYPE_ARGB32: GUID = GUID::from_u128(0x773c9ac0_3274_11d0_b724_00aa006c1a01);
const MEDIASUBTYPE_RGB565: GUID = GUID::from_u128(0xe436eb7b_524f_11ce_9f53_0020af0ba770);
const MEDIASUBTYPE_RGB555: GUID = GUID::from_u128(0xe436eb7c_524f_11ce_9f53_0020af0ba770);
const MEDIASUBTYPE_YUY2: GUID = GUID::from_u128(0x32595559_0000_0010_8000_00aa00389b71);
const MEDIASUBTYPE_UYVY: GUID = GUID::from_u128(0x59565955_0000_0010_8000_00aa00389b71);
const MEDIASUBTYPE_MJPG: GUID = GUID::from_u128(0x47504a4d_0000_0010_8000_00aa00389b71);
const MEDIASUBTYPE_NV12: GUID = GUID::from_u128(0x3231564e_0000_0010_8000_00aa00389b71);
const MEDIASUBTYPE_I420: GUID = GUID::from_u128(0x30323449_0000_0010_8000_00aa00389b71);

pub(super) fn subtype_of(guid: &GUID) -> ColorSubtype {
    match *guid {
        MEDIASUBTYPE_RGB32 => ColorSubtype::Rgb32,
        MEDIASUBTYPE_ARGB32 => ColorSubtype::Argb32,
        MEDIASUBTYPE_RGB24 => ColorSubtype::Rgb24,
        MEDIASUBTYPE_RGB565 | MEDIASUBTYPE_RGB555 => ColorSubtype::Rgb16,
        MEDIASUBTYPE_YUY2 => ColorSubtype::Yuy2,
        MEDIASUBTYPE_UYVY => ColorSubtype::Uyvy,
        MEDIASUBTYPE_MJPG => ColorSubtype::Mjpeg,
        MEDIASUBTYPE_NV12 => ColorSubtype::Nv12,
        MEDIASUBTYPE_I420 => ColorSubtype::I420,
        _ => ColorSubtype::Unknown,
    }
}

/// Zeroed media type asking for RGB24 video, for the sample grabber input.
pub(super) fn rgb24_request() -> AM_MEDIA_TYPE {
    // SAFETY: AM_MEDIA_TYPE is plain data; a zeroed pUnk is `None`.
    let mut mt: AM_MEDIA_TYPE = unsafe { std::mem::zeroed() };
    mt.majortype = MEDIATYPE_VIDEO;
    mt.subtype = MEDIASUBTYPE_RGB24;
    mt.formattype = FORMAT_VIDEOINFO;
    mt
}

/// Bitmap header of a VideoInfo / VideoInfo2 format block.
fn bitmap_header(mt: &AM_MEDIA_TYPE) -> Option<BITMAPINFOHEADER> {
    if mt.pbFormat.is_null() {
        return None;
    }
    let size = mt.cbFormat as usize;
    // SAFETY: pbFormat points to cbFormat bytes, checked against the struct size.
    unsafe {
        if mt.formattype == FORMAT_VIDEOINFO && size >= std::mem::size_of::<VIDEOINFOHEADER>() {
            let vih = std::ptr::read_unaligned(mt.pbFormat as *const VIDEOINFOHEADER);
            Some(vih.bmiHeader)
        } else if mt.formattype == FORMAT_VIDEOINFO2 && size >= std::mem::size_of::<VIDEOINFOHEADER2>() {
            let vih = std::ptr::read_unaligned(mt.pbFormat as *const VIDEOINFOHEADER2);
            Some(vih.bmiHeader)
        } else {
            None
        }
    }
}

/// Free the format block and the `pUnk` reference of a caller-owned media type.
///
/// # Safety
/// `mt` must have been filled in by DirectShow and not freed before.
pub(super) unsafe fn free_format_block(mt: &mut AM_MEDIA_TYPE) {
    if mt.cbFormat != 0 && !mt.pbFormat.is_null() {
        CoTaskMemFree(Some(mt.pbFormat as *const _));
    }
    mt.cbFormat = 0;
    mt.pbFormat = std::ptr::null_mut();
    drop(ManuallyDrop::take(&mut mt.pUnk));
}

// ── OwnedMediaType ─────────────────────────────────────────────────────────────

/// Media type allocated by DirectShow (`GetStreamCaps`). Dropping it frees the
/// format block and the struct itself.
pub(super) struct OwnedMediaType(*mut AM_MEDIA_TYPE);

impl OwnedMediaType {
    /// # Safety
    /// `ptr` must be a CoTaskMem-allocated media type whose ownership passes here.
    pub(super) unsafe fn from_raw(ptr: *mut AM_MEDIA_TYPE) -> Option<Self> {
        (!ptr.is_null()).then_some(Self(ptr))
    }

    pub(super) fn as_ptr(&self) -> *const AM_MEDIA_TYPE {
        self.0
    }

    fn get(&self) -> &AM_MEDIA_TYPE {
        // SAFETY: non-null and owned for our lifetime.
        unsafe { &*self.0 }
    }

    /// Decode into a capability; unknown layouts report zero size.
    pub(super) fn capability(&self, index: usize) -> FormatCapability {
        let mt = self.get();
        let header = bitmap_header(mt);
        FormatCapability {
            width: header.map_or(0, |h| h.biWidth.unsigned_abs()),
            height: header.map_or(0, |h| h.biHeight.unsigned_abs()),
            bits_per_pixel: header.map_or(0, |h| h.biBitCount),
            subtype: subtype_of(&mt.subtype),
            index,
        }
    }
}

impl Drop for OwnedMediaType {
    fn drop(&mut self) {
        // SAFETY: we own the allocation and free it exactly once.
        unsafe {
            free_format_block(&mut *self.0);
            CoTaskMemFree(Some(self.0 as *const _));
        }
    }
}

// ── ConnectedMediaType ─────────────────────────────────────────────────────────

/// Caller-owned media type filled in by `GetConnectedMediaType`.
pub(super) struct ConnectedMediaType(pub(super) AM_MEDIA_TYPE);

impl ConnectedMediaType {
    pub(super) fn zeroed() -> Self {
        // SAFETY: see `rgb24_request`.
        Self(unsafe { std::mem::zeroed() })
    }

    /// Sampler format; positive bitmap heights are bottom-up DIBs.
    pub(super) fn sample_format(&self) -> Option<SampleFormat> {
        let header = bitmap_header(&self.0)?;
        Some(SampleFormat {
            width: header.biWidth.unsigned_abs(),
            height: header.biHeight.unsigned_abs(),
            bits_per_pixel: header.biBitCount,
            bottom_up: header.biHeight > 0,
        })
    }
}

impl Drop for ConnectedMediaType {
    fn drop(&mut self) {
        // SAFETY: the struct is ours; only the format block was allocated for us.
        unsafe { free_format_block(&mut self.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtype_guids() {
        assert_eq!(subtype_of(&MEDIASUBTYPE_YUY2), ColorSubtype::Yuy2);
        assert_eq!(subtype_of(&MEDIASUBTYPE_RGB555), ColorSubtype::Rgb16);
        assert_eq!(subtype_of(&MEDIATYPE_VIDEO), ColorSubtype::Unknown);
    }

    #[test]
    fn zeroed_connected_type_has_no_format() {
        let mt = ConnectedMediaType::zeroed();
        assert!(mt.sample_format().is_none());
    }
}
