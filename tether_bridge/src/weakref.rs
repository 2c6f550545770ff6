//! Weak-reference bridging.
//!
//! Three hooks let a platform weak-reference mechanism interoperate with
//! imported proxies:
//!
//! - [`native_weak_reference_for`]: produce a native weak token for a
//!   managed object by exporting it and asking its weak-reference source
//! - [`resolve_native_weak_reference`]: turn a token back into a managed
//!   object by resolving it and re-importing through the owning bridge
//! - [`possibly_native_backed`]: whether a managed object can be
//!   recreated from a native weak token at all (an aggregated export
//!   cannot — the outer wraps the managed object, not the reverse)

use std::ffi::c_void;
use std::ptr::NonNull;

use tether_core::status::{self, RawStatus};
use tether_core::unknown::{self, OwnedUnknown, UnknownVtbl};
use tether_core::InterfaceId;
use tether_rt::Obj;

use crate::coordinator;
use crate::registry;

/// Native weak-reference tokens.
pub const WEAK_REFERENCE_IID: InterfaceId = InterfaceId::new(
    0xa7e1_52fd,
    0x1b9c,
    0x47d0,
    [0x86, 0x2f, 0xc4, 0x1e, 0x90, 0x6b, 0x3a, 0x58],
);

/// Objects that can mint weak-reference tokens for themselves.
pub const WEAK_REFERENCE_SOURCE_IID: InterfaceId = InterfaceId::new(
    0xd930_7f44,
    0x85ab,
    0x4c29,
    [0x9b, 0x12, 0x6e, 0xf0, 0x27, 0xc9, 0x15, 0x83],
);

/// Weak-reference token table.
#[repr(C)]
pub struct WeakReferenceVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// Resolve the token to a live target, or null if the target died.
    pub resolve:
        unsafe extern "C" fn(*mut c_void, *const InterfaceId, *mut *mut c_void) -> RawStatus,
}

/// Weak-reference source table.
#[repr(C)]
pub struct WeakReferenceSourceVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// Mint a weak-reference token for this object.
    pub get_weak_reference: unsafe extern "C" fn(*mut c_void, *mut *mut c_void) -> RawStatus,
}

unsafe fn resolve_token(
    token: *mut c_void,
    iid: &InterfaceId,
) -> Result<NonNull<c_void>, RawStatus> {
    let vtbl = &**(token as *mut *const WeakReferenceVtbl);
    let mut out: *mut c_void = std::ptr::null_mut();
    let rc = (vtbl.resolve)(token, iid, &mut out);
    match NonNull::new(out) {
        Some(nn) if status::is_ok(rc) => Ok(nn),
        _ => Err(if status::is_ok(rc) { status::FAIL } else { rc }),
    }
}

unsafe fn get_weak_reference(source: *mut c_void) -> Result<NonNull<c_void>, RawStatus> {
    let vtbl = &**(source as *mut *const WeakReferenceSourceVtbl);
    let mut out: *mut c_void = std::ptr::null_mut();
    let rc = (vtbl.get_weak_reference)(source, &mut out);
    match NonNull::new(out) {
        Some(nn) if status::is_ok(rc) => Ok(nn),
        _ => Err(if status::is_ok(rc) { status::FAIL } else { rc }),
    }
}

/// Resolve a native weak-reference token back into a managed object.
///
/// A failed or null resolution means the underlying native object is
/// gone, and no proxy can be recreated.
///
/// # Safety
///
/// `token` must be a live weak-reference token pointer.
pub unsafe fn resolve_native_weak_reference(token: *mut c_void, bridge_id: u64) -> Option<Obj> {
    if bridge_id == 0 {
        return None;
    }
    let target = resolve_token(token, &InterfaceId::UNKNOWN).ok()?;
    let target = OwnedUnknown::adopt(target);
    let identity = unknown::query_interface(target.as_ptr(), &InterfaceId::UNKNOWN).ok()?;
    let identity = OwnedUnknown::adopt(identity);
    registry::object_from_bridge_id(bridge_id, identity.as_ptr())
}

/// Whether `target` could be recreated from a native weak reference.
///
/// Aggregated exports are disqualified: their outer object wraps the
/// managed one, so the managed identity cannot be recovered from the
/// native side alone.
pub fn possibly_native_backed(target: &Obj) -> bool {
    coordinator::wrapper_for_proxy(target)
        .map(|wrapper| !wrapper.is_aggregated_export())
        .unwrap_or(false)
}

/// Produce a native weak-reference token for `target`, along with the
/// owning bridge's id for later resolution. `None` when the target's
/// native object does not mint weak references.
pub fn native_weak_reference_for(target: &Obj) -> Option<(OwnedUnknown, u64)> {
    let (source, bridge_id) =
        coordinator::native_for_object_with_interface(target, &WEAK_REFERENCE_SOURCE_IID)?;
    let token = unsafe { get_weak_reference(source.as_ptr()) }.ok()?;
    Some((unsafe { OwnedUnknown::adopt(token) }, bridge_id))
}
