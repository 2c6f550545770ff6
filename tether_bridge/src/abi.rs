//! ABI entry points and runtime-defined vtables.
//!
//! Every runtime-installed dispatch table starts with the three base
//! slots (`query_interface`, `add_ref`, `release`); the tracker-target
//! table adds the four tracker slots and the tagged table adds the
//! protocol-version check. Entry points recover their wrapper by masking
//! the incoming slot pointer (see [`crate::dispatch`]).
//!
//! No panic crosses the boundary: every entry point runs under a guard
//! that converts an unwind into the catch-all failure status (or a zero
//! count for the counting entries).

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

use tether_core::status::{self, RawStatus};
use tether_core::unknown::{self, UnknownVtbl};
use tether_core::InterfaceId;
use tether_rt::Obj;

use crate::dispatch;
use crate::exported::ExportedWrapper;

/// Marker interface identifying wrappers of this family even when the
/// caller supplied its own base vtable. The identifier is fixed and was
/// chosen randomly; it corresponds to no public interface.
pub const TAGGED_IID: InterfaceId = InterfaceId::new(
    0x3f9a_1ee4,
    0x5c71,
    0x4a2c,
    [0x93, 0x0e, 0x7b, 0x1d, 0x52, 0xa8, 0x44, 0x6d],
);

/// Tagged marker table: base slots plus the protocol-version check.
#[repr(C)]
pub struct TaggedVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// Succeeds only when `version` is this runtime's own check routine,
    /// proving caller and wrapper share one protocol version.
    pub is_current_version: unsafe extern "C" fn(*mut c_void, *mut c_void) -> RawStatus,
}

/// Tracker-target table: base slots (tracker-guarded query) plus the
/// tracker reference and pegging operations.
#[repr(C)]
pub struct TrackerTargetVtbl {
    /// Base slots; the query refuses during teardown.
    pub base: UnknownVtbl,
    /// Add one tracker reference.
    pub add_ref_from_tracker: unsafe extern "C" fn(*mut c_void) -> u32,
    /// Drop one tracker reference; the last one under a destroy sentinel
    /// runs destruction.
    pub release_from_tracker: unsafe extern "C" fn(*mut c_void) -> u32,
    /// Force conservative rooting of this wrapper.
    pub peg: unsafe extern "C" fn(*mut c_void) -> u32,
    /// Withdraw conservative rooting.
    pub unpeg: unsafe extern "C" fn(*mut c_void) -> u32,
}

static EXPORT_UNKNOWN_VTBL: UnknownVtbl = UnknownVtbl {
    query_interface: export_query_interface,
    add_ref: export_add_ref,
    release: export_release,
};

static EXPORT_TAGGED_VTBL: TaggedVtbl = TaggedVtbl {
    base: UnknownVtbl {
        query_interface: export_query_interface,
        add_ref: export_add_ref,
        release: export_release,
    },
    is_current_version: tagged_is_current_version,
};

static EXPORT_TRACKER_TARGET_VTBL: TrackerTargetVtbl = TrackerTargetVtbl {
    base: UnknownVtbl {
        query_interface: tracker_target_query_interface,
        add_ref: export_add_ref,
        release: export_release,
    },
    add_ref_from_tracker: tracker_target_add_ref_from_tracker,
    release_from_tracker: tracker_target_release_from_tracker,
    peg: tracker_target_peg,
    unpeg: tracker_target_unpeg,
};

pub(crate) fn unknown_vtbl_ptr() -> *const c_void {
    &EXPORT_UNKNOWN_VTBL as *const UnknownVtbl as *const c_void
}

pub(crate) fn tagged_vtbl_ptr() -> *const c_void {
    &EXPORT_TAGGED_VTBL as *const TaggedVtbl as *const c_void
}

pub(crate) fn tracker_target_vtbl_ptr() -> *const c_void {
    &EXPORT_TRACKER_TARGET_VTBL as *const TrackerTargetVtbl as *const c_void
}

/// Run an ABI body, converting any unwind into `FAIL`.
fn guard_status(body: impl FnOnce() -> RawStatus) -> RawStatus {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(status::FAIL)
}

/// Run a counting ABI body, converting any unwind into a zero count.
fn guard_count(body: impl FnOnce() -> u32) -> u32 {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(0)
}

unsafe extern "C" fn export_query_interface(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    guard_status(|| unsafe {
        if iid.is_null() || out.is_null() {
            return status::INVALID_ARGUMENT;
        }
        let wrapper = &*dispatch::wrapper_from_slot(this);
        match wrapper.query_interface(&*iid) {
            Ok(ptr) => {
                *out = ptr;
                status::OK
            }
            Err(rc) => {
                *out = std::ptr::null_mut();
                rc
            }
        }
    })
}

unsafe extern "C" fn export_add_ref(this: *mut c_void) -> u32 {
    guard_count(|| unsafe { (*dispatch::wrapper_from_slot(this)).add_ref() })
}

unsafe extern "C" fn export_release(this: *mut c_void) -> u32 {
    guard_count(|| unsafe { (*dispatch::wrapper_from_slot(this)).release() })
}

unsafe extern "C" fn tracker_target_query_interface(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    guard_status(|| unsafe {
        if iid.is_null() || out.is_null() {
            return status::INVALID_ARGUMENT;
        }
        let wrapper = &*dispatch::wrapper_from_slot(this);
        match wrapper.query_interface_for_tracker(&*iid) {
            Ok(ptr) => {
                *out = ptr;
                status::OK
            }
            Err(rc) => {
                *out = std::ptr::null_mut();
                rc
            }
        }
    })
}

unsafe extern "C" fn tracker_target_add_ref_from_tracker(this: *mut c_void) -> u32 {
    guard_count(|| unsafe { (*dispatch::wrapper_from_slot(this)).add_ref_from_tracker() })
}

unsafe extern "C" fn tracker_target_release_from_tracker(this: *mut c_void) -> u32 {
    guard_count(|| unsafe { (*dispatch::wrapper_from_slot(this)).release_from_tracker() })
}

unsafe extern "C" fn tracker_target_peg(this: *mut c_void) -> u32 {
    guard_count(|| unsafe {
        (*dispatch::wrapper_from_slot(this)).peg();
        status::OK as u32
    })
}

unsafe extern "C" fn tracker_target_unpeg(this: *mut c_void) -> u32 {
    guard_count(|| unsafe {
        (*dispatch::wrapper_from_slot(this)).unpeg();
        status::OK as u32
    })
}

unsafe extern "C" fn tagged_is_current_version(
    _this: *mut c_void,
    version: *mut c_void,
) -> RawStatus {
    if version as usize == tagged_is_current_version as usize {
        status::OK
    } else {
        status::FAIL
    }
}

/// Identify whether `ptr` points into one of this runtime's dispatch
/// sections, returning the owning wrapper.
///
/// The fast path compares the first vtable slot against the two query
/// routines the runtime installs. When the caller supplied its own base
/// vtable that comparison fails, so the tagged marker interface is
/// queried and asked whether it speaks the current protocol version.
///
/// # Safety
///
/// `ptr` must be a live interface pointer.
pub unsafe fn dispatch_from_unknown(ptr: *mut c_void) -> Option<*mut ExportedWrapper> {
    let vtable = (ptr as *const *const c_void).read();
    let first_slot = (vtable as *const usize).read();
    if first_slot == export_query_interface as usize
        || first_slot == tracker_target_query_interface as usize
    {
        return Some(dispatch::wrapper_from_slot(ptr));
    }

    let tagged = unknown::query_interface(ptr, &TAGGED_IID).ok()?;
    let guard = unknown::OwnedUnknown::adopt(tagged);
    let vtbl = &**(guard.as_ptr() as *mut *const TaggedVtbl);
    let current = (vtbl.is_current_version)(
        guard.as_ptr(),
        tagged_is_current_version as usize as *mut c_void,
    );
    if current == status::OK {
        Some(dispatch::wrapper_from_slot(ptr))
    } else {
        None
    }
}

/// Recover the managed object behind an exported interface pointer, if
/// `ptr` belongs to this wrapper family and is not mid-teardown.
///
/// # Safety
///
/// `ptr` must be a live interface pointer.
pub unsafe fn object_from_unknown(ptr: *mut c_void) -> Option<Obj> {
    if ptr.is_null() {
        return None;
    }
    let wrapper = dispatch_from_unknown(ptr)?;
    let wrapper = &*wrapper;
    if wrapper.marked_to_destroy() {
        return None;
    }
    wrapper.wrapped_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exported::{ExportFlags, ExportedHolder};
    use std::any::Any;
    use std::sync::Arc;
    use tether_core::{CustomQueryInterface, CustomQueryOutcome};
    use tether_rt::ManagedObject;

    struct Plain;

    impl ManagedObject for Plain {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Panicky;

    impl ManagedObject for Panicky {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn custom_query_interface(&self) -> Option<&dyn CustomQueryInterface> {
            Some(self)
        }
    }

    impl CustomQueryInterface for Panicky {
        fn get_interface(&self, _iid: &InterfaceId) -> CustomQueryOutcome {
            panic!("query probe exploded");
        }
    }

    fn export(obj: Obj, flags: ExportFlags) -> (*mut ExportedWrapper, Arc<ExportedHolder>, *mut c_void) {
        let wrapper = ExportedWrapper::allocate(&[], flags);
        let holder = ExportedHolder::install(wrapper, obj);
        let unknown = holder.unknown_ptr().unwrap();
        (wrapper, holder, unknown)
    }

    fn teardown(holder: Arc<ExportedHolder>) {
        drop(holder);
        tether_rt::runtime().collect();
        tether_rt::runtime().collect();
    }

    #[test]
    fn test_abi_query_and_release_round_trip() {
        let (wrapper, holder, unknown_ptr) = export(Arc::new(Plain), ExportFlags::empty());
        unsafe {
            let mut out: *mut c_void = std::ptr::null_mut();
            let vt = unknown::vtbl(unknown_ptr);
            assert_eq!(
                (vt.query_interface)(unknown_ptr, &InterfaceId::UNKNOWN, &mut out),
                status::OK
            );
            assert_eq!(out, unknown_ptr);
            assert_eq!((*wrapper).refcount_raw(), 1);
            assert_eq!((vt.release)(out), 0);
        }
        teardown(holder);
    }

    #[test]
    fn test_null_out_pointer_is_invalid_argument() {
        let (_wrapper, holder, unknown_ptr) = export(Arc::new(Plain), ExportFlags::empty());
        unsafe {
            let vt = unknown::vtbl(unknown_ptr);
            assert_eq!(
                (vt.query_interface)(unknown_ptr, &InterfaceId::UNKNOWN, std::ptr::null_mut()),
                status::INVALID_ARGUMENT
            );
        }
        teardown(holder);
    }

    #[test]
    fn test_panic_converts_to_fail_status() {
        let (_wrapper, holder, unknown_ptr) = export(Arc::new(Panicky), ExportFlags::empty());
        let missing = InterfaceId::new(0xdead, 0, 0, [0; 8]);
        unsafe {
            let mut out: *mut c_void = std::ptr::null_mut();
            let vt = unknown::vtbl(unknown_ptr);
            assert_eq!(
                (vt.query_interface)(unknown_ptr, &missing, &mut out),
                status::FAIL
            );
        }
        teardown(holder);
    }

    #[test]
    fn test_dispatch_recognition_fast_path() {
        let (wrapper, holder, unknown_ptr) = export(Arc::new(Plain), ExportFlags::empty());
        unsafe {
            assert_eq!(dispatch_from_unknown(unknown_ptr), Some(wrapper));
        }
        teardown(holder);
    }

    #[test]
    fn test_dispatch_recognition_via_tagged_protocol() {
        // A tracker-target pointer exercises the tracker query routine in
        // slot zero; the tagged slot exercises the slow path.
        let (wrapper, holder, unknown_ptr) = export(Arc::new(Plain), ExportFlags::TRACKER_SUPPORT);
        unsafe {
            let w = &*wrapper;
            let tagged_ptr = w.as_interface(&TAGGED_IID).unwrap();
            assert_eq!(dispatch_from_unknown(tagged_ptr), Some(wrapper));
            let tracker_ptr = w
                .as_interface(&crate::tracker::TRACKER_TARGET_IID)
                .unwrap();
            assert_eq!(dispatch_from_unknown(tracker_ptr), Some(wrapper));
        }
        let _ = unknown_ptr;
        teardown(holder);
    }

    #[test]
    fn test_object_from_unknown_round_trip() {
        let obj: Obj = Arc::new(Plain);
        let expected = tether_rt::object_identity(&obj);
        let (_wrapper, holder, unknown_ptr) = export(obj, ExportFlags::empty());
        unsafe {
            let resolved = object_from_unknown(unknown_ptr).unwrap();
            assert_eq!(tether_rt::object_identity(&resolved), expected);
        }
        teardown(holder);
    }

    #[test]
    fn test_object_from_unknown_refuses_teardown() {
        let (wrapper, holder, unknown_ptr) = export(Arc::new(Plain), ExportFlags::empty());
        unsafe {
            (*wrapper).destroy();
            assert!(object_from_unknown(unknown_ptr).is_none());
        }
        teardown(holder);
    }
}
