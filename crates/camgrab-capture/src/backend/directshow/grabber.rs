//! Sample Grabber filter plumbing.
//!
//! `ISampleGrabber` and `ISampleGrabberCB` are not in the Windows metadata
//! (qedit.h is deprecated), so both vtables are laid out by hand. The callback
//! object owns an `Arc<FrameSampler>` and forwards every `BufferCB` to
//! [`FrameSampler::deliver`].

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use windows::core::{Interface, GUID, HRESULT};
use windows::Win32::Foundation::{E_NOINTERFACE, E_POINTER, S_OK};
use windows::Win32::Media::DirectShow::IBaseFilter;
use windows::Win32::Media::MediaFoundation::AM_MEDIA_TYPE;

use super::media_type::ConnectedMediaType;
use crate::sampler::FrameSampler;

// IUnknown: {00000000-0000-0000-C000-000000000046}
const IID_IUNKNOWN: GUID = GUID::from_u128(0x00000000_0000_0000_c000_000000000046);

// ISampleGrabber: {6B652FFF-11FE-4FCE-92AD-0266B5D7C78F}
const IID_ISAMPLEGRABBER: GUID = GUID::from_u128(0x6b652fff_11fe_4fce_92ad_0266b5d7c78f);

// ISampleGrabberCB: {0579154A-2B53-4994-B0D0-E773148EFF85}
const IID_ISAMPLEGRABBER_CB: GUID = GUID::from_u128(0x0579154a_2b53_4994_b0d0_e773148eff85);

/// `SetCallback` selector for `BufferCB`.
const BUFFER_CB: i32 = 1;

type QueryInterfaceFn = unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT;
type RefCountFn = unsafe extern "system" fn(*mut c_void) -> u32;

// ── ISampleGrabber ─────────────────────────────────────────────────────────────

#[repr(C)]
struct ISampleGrabberVtbl {
    query_interface: QueryInterfaceFn,
    add_ref: RefCountFn,
    release: RefCountFn,
    set_one_shot: unsafe extern "system" fn(*mut c_void, i32) -> HRESULT,
    set_media_type: unsafe extern "system" fn(*mut c_void, *const AM_MEDIA_TYPE) -> HRESULT,
    get_connected_media_type: unsafe extern "system" fn(*mut c_void, *mut AM_MEDIA_TYPE) -> HRESULT,
    set_buffer_samples: unsafe extern "system" fn(*mut c_void, i32) -> HRESULT,
    get_current_buffer: unsafe extern "system" fn(*mut c_void, *mut i32, *mut i32) -> HRESULT,
    get_current_sample: unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT,
    set_callback: unsafe extern "system" fn(*mut c_void, *mut c_void, i32) -> HRESULT,
}

/// Owned `ISampleGrabber` reference.
pub(super) struct SampleGrabber {
    ptr: *mut c_void,
}

impl SampleGrabber {
    pub(super) fn from_filter(filter: &IBaseFilter) -> Result<Self> {
        let mut ptr = std::ptr::null_mut();
        // SAFETY: plain QueryInterface on a live filter.
        let hr = unsafe { filter.query(&IID_ISAMPLEGRABBER, &mut ptr) };
        if hr.is_err() || ptr.is_null() {
            bail!("QueryInterface(ISampleGrabber) failed: {:?}", hr);
        }
        Ok(Self { ptr })
    }

    fn vtbl(&self) -> &ISampleGrabberVtbl {
        // SAFETY: a COM pointer starts with its vtable pointer.
        unsafe { &**(self.ptr as *const *const ISampleGrabberVtbl) }
    }

    pub(super) fn set_media_type(&self, mt: &AM_MEDIA_TYPE) -> Result<()> {
        // SAFETY: `mt` outlives the call; the grabber copies it.
        unsafe { (self.vtbl().set_media_type)(self.ptr, mt) }.ok()?;
        Ok(())
    }

    pub(super) fn set_one_shot(&self, one_shot: bool) -> Result<()> {
        unsafe { (self.vtbl().set_one_shot)(self.ptr, i32::from(one_shot)) }.ok()?;
        Ok(())
    }

    pub(super) fn set_buffer_samples(&self, buffer: bool) -> Result<()> {
        unsafe { (self.vtbl().set_buffer_samples)(self.ptr, i32::from(buffer)) }.ok()?;
        Ok(())
    }

    pub(super) fn connected_media_type(&self) -> Result<ConnectedMediaType> {
        let mut mt = ConnectedMediaType::zeroed();
        // SAFETY: the grabber fills a caller-owned struct; the guard frees its block.
        unsafe { (self.vtbl().get_connected_media_type)(self.ptr, &mut mt.0) }.ok()?;
        Ok(mt)
    }

    /// Install `callback` for `BufferCB`. The grabber takes its own reference.
    pub(super) fn set_callback(&self, callback: &GrabberCallback) -> Result<()> {
        unsafe { (self.vtbl().set_callback)(self.ptr, callback.as_raw(), BUFFER_CB) }.ok()?;
        Ok(())
    }

    /// Drop the grabber's callback reference; no `BufferCB` runs afterwards.
    pub(super) fn clear_callback(&self) -> Result<()> {
        unsafe { (self.vtbl().set_callback)(self.ptr, std::ptr::null_mut(), BUFFER_CB) }.ok()?;
        Ok(())
    }
}

impl Drop for SampleGrabber {
    fn drop(&mut self) {
        // SAFETY: releases the reference taken in `from_filter`.
        unsafe { (self.vtbl().release)(self.ptr) };
    }
}

// ── ISampleGrabberCB ───────────────────────────────────────────────────────────

#[repr(C)]
struct ISampleGrabberCBVtbl {
    query_interface: QueryInterfaceFn,
    add_ref: RefCountFn,
    release: RefCountFn,
    sample_cb: unsafe extern "system" fn(*mut c_void, f64, *mut c_void) -> HRESULT,
    buffer_cb: unsafe extern "system" fn(*mut c_void, f64, *mut u8, i32) -> HRESULT,
}

#[repr(C)]
struct CallbackObject {
    vtbl: *const ISampleGrabberCBVtbl,
    refs: AtomicU32,
    sampler: Arc<FrameSampler>,
}

static CALLBACK_VTBL: ISampleGrabberCBVtbl = ISampleGrabberCBVtbl {
    query_interface: cb_query_interface,
    add_ref: cb_add_ref,
    release: cb_release,
    sample_cb: cb_sample_cb,
    buffer_cb: cb_buffer_cb,
};

unsafe extern "system" fn cb_query_interface(
    this: *mut c_void,
    riid: *const GUID,
    ppv: *mut *mut c_void,
) -> HRESULT {
    if riid.is_null() || ppv.is_null() {
        return E_POINTER;
    }
    if *riid == IID_ISAMPLEGRABBER_CB || *riid == IID_IUNKNOWN {
        *ppv = this;
        cb_add_ref(this);
        S_OK
    } else {
        *ppv = std::ptr::null_mut();
        E_NOINTERFACE
    }
}

unsafe extern "system" fn cb_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const CallbackObject);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "system" fn cb_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const CallbackObject);
    let prev = obj.refs.fetch_sub(1, Ordering::AcqRel);
    if prev == 1 {
        drop(Box::from_raw(this as *mut CallbackObject));
        return 0;
    }
    prev - 1
}

unsafe extern "system" fn cb_sample_cb(_this: *mut c_void, _time: f64, _sample: *mut c_void) -> HRESULT {
    S_OK
}

unsafe extern "system" fn cb_buffer_cb(this: *mut c_void, _time: f64, buffer: *mut u8, len: i32) -> HRESULT {
    let obj = &*(this as *const CallbackObject);
    if buffer.is_null() || len <= 0 {
        obj.sampler.deliver(&[]);
        return S_OK;
    }
    // the buffer is only valid for this call; deliver copies what it keeps
    let data = std::slice::from_raw_parts(buffer, len as usize);
    obj.sampler.deliver(data);
    S_OK
}

/// Our reference to an `ISampleGrabberCB` object.
pub(super) struct GrabberCallback {
    ptr: *mut c_void,
}

impl GrabberCallback {
    pub(super) fn new(sampler: Arc<FrameSampler>) -> Self {
        let obj = Box::new(CallbackObject {
            vtbl: &CALLBACK_VTBL,
            refs: AtomicU32::new(1),
            sampler,
        });
        Self { ptr: Box::into_raw(obj) as *mut c_void }
    }

    fn as_raw(&self) -> *mut c_void {
        self.ptr
    }
}

impl Drop for GrabberCallback {
    fn drop(&mut self) {
        // SAFETY: releases the reference created in `new`.
        unsafe { cb_release(self.ptr) };
    }
}
