//! In-crate test doubles shared by unit tests.

use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tether_core::status::{self, RawStatus};
use tether_core::unknown::UnknownVtbl;
use tether_core::{InterfaceEntry, InterfaceId};
use tether_rt::{ManagedObject, Obj};

use crate::coordinator::{Bridge, BridgeHost};
use crate::exported::ExportFlags;
use crate::imported::ImportFlags;

/// Minimal counted native object answering only the base interface.
#[repr(C)]
pub(crate) struct MiniNative {
    vtbl: *const UnknownVtbl,
    refs: AtomicU32,
}

static MINI_VTBL: UnknownVtbl = UnknownVtbl {
    query_interface: mini_qi,
    add_ref: mini_add_ref,
    release: mini_release,
};

unsafe extern "C" fn mini_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN {
        mini_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn mini_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const MiniNative);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn mini_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const MiniNative);
    obj.refs.fetch_sub(1, Ordering::AcqRel) - 1
}

impl MiniNative {
    pub(crate) fn new() -> Box<MiniNative> {
        Box::new(MiniNative {
            vtbl: &MINI_VTBL,
            refs: AtomicU32::new(1),
        })
    }

    pub(crate) fn ptr(&self) -> *mut c_void {
        self as *const MiniNative as *mut c_void
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Minimal managed proxy.
pub(crate) struct MiniProxy;

impl ManagedObject for MiniProxy {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Host double with no vtables and `MiniProxy` imports.
pub(crate) struct MiniHost;

impl BridgeHost for MiniHost {
    fn compute_vtables(&self, _instance: &Obj, _flags: ExportFlags) -> &'static [InterfaceEntry] {
        &[]
    }

    fn create_proxy(&self, _identity: *mut c_void, _flags: ImportFlags) -> Option<Obj> {
        Some(Arc::new(MiniProxy))
    }
}

pub(crate) fn mini_bridge() -> Arc<Bridge> {
    Bridge::new(MiniHost)
}
