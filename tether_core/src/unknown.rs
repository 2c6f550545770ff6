//! Raw calls through the three-slot base vtable.
//!
//! Every native object the bridge touches is a pointer to a vtable
//! pointer whose first three slots are `query_interface`, `add_ref`,
//! `release`. The helpers here are the only place the bridge dereferences
//! foreign vtables directly; everything above works with the returned
//! pointers or the [`OwnedUnknown`] guard.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::interface::InterfaceId;
use crate::status::{self, RawStatus};

/// `query_interface` slot signature.
pub type QueryInterfaceFn =
    unsafe extern "C" fn(*mut c_void, *const InterfaceId, *mut *mut c_void) -> RawStatus;
/// `add_ref` slot signature.
pub type AddRefFn = unsafe extern "C" fn(*mut c_void) -> u32;
/// `release` slot signature.
pub type ReleaseFn = unsafe extern "C" fn(*mut c_void) -> u32;

/// The three-slot base vtable every native object starts with.
#[repr(C)]
pub struct UnknownVtbl {
    /// Select an interface by identifier, adding a reference on success.
    pub query_interface: QueryInterfaceFn,
    /// Add one reference, returning the new count.
    pub add_ref: AddRefFn,
    /// Drop one reference, returning the new count.
    pub release: ReleaseFn,
}

/// Read the base vtable behind an interface pointer.
///
/// # Safety
///
/// `ptr` must be a live interface pointer: a pointer to a pointer to a
/// vtable whose first three slots match [`UnknownVtbl`].
#[inline]
pub unsafe fn vtbl<'a>(ptr: *mut c_void) -> &'a UnknownVtbl {
    &**(ptr as *mut *const UnknownVtbl)
}

/// Query `ptr` for `iid`.
///
/// On success the returned pointer carries one reference the caller must
/// eventually release.
///
/// # Safety
///
/// `ptr` must be a live interface pointer (see [`vtbl`]).
pub unsafe fn query_interface(
    ptr: *mut c_void,
    iid: &InterfaceId,
) -> Result<NonNull<c_void>, RawStatus> {
    let mut out: *mut c_void = std::ptr::null_mut();
    let rc = (vtbl(ptr).query_interface)(ptr, iid, &mut out);
    match NonNull::new(out) {
        Some(nn) if status::is_ok(rc) => Ok(nn),
        _ if status::is_ok(rc) => Err(status::FAIL),
        _ => Err(rc),
    }
}

/// Add one reference to `ptr`.
///
/// # Safety
///
/// `ptr` must be a live interface pointer (see [`vtbl`]).
#[inline]
pub unsafe fn add_ref(ptr: *mut c_void) -> u32 {
    (vtbl(ptr).add_ref)(ptr)
}

/// Drop one reference from `ptr`.
///
/// # Safety
///
/// `ptr` must be a live interface pointer holding at least one reference
/// owned by the caller.
#[inline]
pub unsafe fn release(ptr: *mut c_void) -> u32 {
    (vtbl(ptr).release)(ptr)
}

/// Owning guard over one native reference; releases on drop.
///
/// Native release never unwinds across the ABI, so dropping a guard is
/// infallible.
pub struct OwnedUnknown {
    ptr: NonNull<c_void>,
}

impl OwnedUnknown {
    /// Adopt a pointer that already carries one reference.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live interface pointer and the caller must own the
    /// reference being adopted.
    pub unsafe fn adopt(ptr: NonNull<c_void>) -> Self {
        Self { ptr }
    }

    /// The guarded pointer. Does not transfer the reference.
    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// Give up ownership of the reference without releasing it.
    pub fn into_raw(self) -> *mut c_void {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Drop for OwnedUnknown {
    fn drop(&mut self) {
        unsafe {
            release(self.ptr.as_ptr());
        }
    }
}

// Safety: the guarded object model is free-threaded; a reference may be
// released from any thread.
unsafe impl Send for OwnedUnknown {}
