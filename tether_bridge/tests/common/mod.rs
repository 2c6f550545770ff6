//! Native test doubles: reference-counted vtable objects standing in for
//! the native side of the bridge.

#![allow(dead_code)]

use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tether_bridge::tracker::{
    FindTargetsCallbackVtbl, TrackerManagerVtbl, TrackerVtbl, TRACKER_IID,
};
use tether_bridge::{BridgeHost, ExportFlags, ImportFlags};
use tether_core::status::{self, RawStatus};
use tether_core::unknown::UnknownVtbl;
use tether_core::{InterfaceEntry, InterfaceId};
use tether_rt::{ManagedObject, Obj};

// =============================================================================
// Plain counted native object
// =============================================================================

/// A native object answering the base interface (and nothing else), with
/// an observable reference count. The owning `Box` controls the memory;
/// release never frees.
#[repr(C)]
pub struct NativeObject {
    vtbl: *const UnknownVtbl,
    refs: AtomicU32,
}

static NATIVE_OBJECT_VTBL: UnknownVtbl = UnknownVtbl {
    query_interface: native_qi,
    add_ref: native_add_ref,
    release: native_release,
};

unsafe extern "C" fn native_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN {
        native_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn native_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const NativeObject);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn native_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const NativeObject);
    let prev = obj.refs.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "native object over-released");
    prev - 1
}

impl NativeObject {
    pub fn new() -> Box<NativeObject> {
        Box::new(NativeObject {
            vtbl: &NATIVE_OBJECT_VTBL,
            refs: AtomicU32::new(1),
        })
    }

    pub fn ptr(&self) -> *mut c_void {
        self as *const NativeObject as *mut c_void
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tracker manager double
// =============================================================================

/// Records every manager notification the bridge sends.
#[repr(C)]
pub struct ManagerObject {
    vtbl: *const TrackerManagerVtbl,
    refs: AtomicU32,
    pub started: AtomicU32,
    pub completed: AtomicU32,
    pub walks_completed: AtomicU32,
    pub walks_failed: AtomicU32,
    pub host: AtomicUsize,
}

static MANAGER_VTBL: TrackerManagerVtbl = TrackerManagerVtbl {
    base: UnknownVtbl {
        query_interface: manager_qi,
        add_ref: manager_add_ref,
        release: manager_release,
    },
    tracking_started: manager_tracking_started,
    find_targets_completed: manager_find_targets_completed,
    tracking_completed: manager_tracking_completed,
    set_tracker_host: manager_set_tracker_host,
};

unsafe extern "C" fn manager_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN {
        manager_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn manager_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const ManagerObject);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn manager_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const ManagerObject);
    obj.refs.fetch_sub(1, Ordering::AcqRel) - 1
}

unsafe extern "C" fn manager_tracking_started(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const ManagerObject);
    obj.started.fetch_add(1, Ordering::AcqRel);
    status::OK
}

unsafe extern "C" fn manager_find_targets_completed(this: *mut c_void, failed: i32) -> RawStatus {
    let obj = &*(this as *const ManagerObject);
    if failed != 0 {
        obj.walks_failed.fetch_add(1, Ordering::AcqRel);
    } else {
        obj.walks_completed.fetch_add(1, Ordering::AcqRel);
    }
    status::OK
}

unsafe extern "C" fn manager_tracking_completed(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const ManagerObject);
    obj.completed.fetch_add(1, Ordering::AcqRel);
    status::OK
}

unsafe extern "C" fn manager_set_tracker_host(this: *mut c_void, host: *mut c_void) -> RawStatus {
    let obj = &*(this as *const ManagerObject);
    obj.host.store(host as usize, Ordering::Release);
    status::OK
}

impl ManagerObject {
    /// The shared manager every tracker double hands out. The bridge
    /// discovers the manager once per process, so tests share one.
    pub fn shared() -> &'static ManagerObject {
        static SHARED: std::sync::OnceLock<ManagerObject> = std::sync::OnceLock::new();
        SHARED.get_or_init(|| ManagerObject {
            vtbl: &MANAGER_VTBL,
            refs: AtomicU32::new(1),
            started: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            walks_completed: AtomicU32::new(0),
            walks_failed: AtomicU32::new(0),
            host: AtomicUsize::new(0),
        })
    }

    pub fn ptr(&self) -> *mut c_void {
        self as *const ManagerObject as *mut c_void
    }
}

unsafe impl Sync for ManagerObject {}
unsafe impl Send for ManagerObject {}

// =============================================================================
// Tracker object double
// =============================================================================

/// A native object that answers the tracker interface: counts protocol
/// references, reports a configurable target list on walks, and can be
/// told to fail its walk.
#[repr(C)]
pub struct TrackerObject {
    vtbl: *const TrackerVtbl,
    refs: AtomicU32,
    pub source_refs: AtomicI32,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub fail_walk: AtomicBool,
    pub targets: Mutex<Vec<usize>>,
}

static TRACKER_OBJECT_VTBL: TrackerVtbl = TrackerVtbl {
    base: UnknownVtbl {
        query_interface: tracker_qi,
        add_ref: tracker_add_ref,
        release: tracker_release,
    },
    connect_from_source: tracker_connect,
    disconnect_from_source: tracker_disconnect,
    find_targets: tracker_find_targets,
    get_manager: tracker_get_manager,
    add_ref_from_source: tracker_add_ref_from_source,
    release_from_source: tracker_release_from_source,
};

unsafe extern "C" fn tracker_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN || *iid == TRACKER_IID {
        tracker_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn tracker_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const TrackerObject);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn tracker_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const TrackerObject);
    let prev = obj.refs.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "tracker object over-released");
    prev - 1
}

unsafe extern "C" fn tracker_connect(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const TrackerObject);
    obj.connects.fetch_add(1, Ordering::AcqRel);
    status::OK
}

unsafe extern "C" fn tracker_disconnect(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const TrackerObject);
    obj.disconnects.fetch_add(1, Ordering::AcqRel);
    status::OK
}

unsafe extern "C" fn tracker_find_targets(this: *mut c_void, callback: *mut c_void) -> RawStatus {
    let obj = &*(this as *const TrackerObject);
    if obj.fail_walk.load(Ordering::Acquire) {
        return status::FAIL;
    }
    let targets = obj.targets.lock().unwrap().clone();
    let vtbl = &**(callback as *mut *const FindTargetsCallbackVtbl);
    for target in targets {
        let rc = (vtbl.found_target)(callback, target as *mut c_void);
        if rc != status::OK {
            return rc;
        }
    }
    status::OK
}

unsafe extern "C" fn tracker_get_manager(this: *mut c_void, out: *mut *mut c_void) -> RawStatus {
    let _ = this;
    let manager = ManagerObject::shared();
    manager_add_ref(manager.ptr());
    *out = manager.ptr();
    status::OK
}

unsafe extern "C" fn tracker_add_ref_from_source(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const TrackerObject);
    obj.source_refs.fetch_add(1, Ordering::AcqRel);
    status::OK
}

unsafe extern "C" fn tracker_release_from_source(this: *mut c_void) -> RawStatus {
    let obj = &*(this as *const TrackerObject);
    let prev = obj.source_refs.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "tracker source references over-released");
    status::OK
}

impl TrackerObject {
    pub fn new() -> Box<TrackerObject> {
        Box::new(TrackerObject {
            vtbl: &TRACKER_OBJECT_VTBL,
            refs: AtomicU32::new(1),
            source_refs: AtomicI32::new(0),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            fail_walk: AtomicBool::new(false),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn ptr(&self) -> *mut c_void {
        self as *const TrackerObject as *mut c_void
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn source_refs(&self) -> i32 {
        self.source_refs.load(Ordering::Acquire)
    }
}

// =============================================================================
// Managed side: proxy type and bridge host
// =============================================================================

/// The proxy type the test host materializes for imports.
pub struct Proxy {
    pub identity: usize,
}

impl ManagedObject for Proxy {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Plain managed instance for exports.
pub struct Instance {
    pub tag: u32,
}

impl ManagedObject for Instance {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared observable state of a [`TestHost`].
#[derive(Default)]
pub struct HostState {
    pub created: AtomicU32,
    pub bulk_released: AtomicU32,
    pub refuse_proxies: AtomicBool,
}

/// Bridge host double: empty vtable sets, `Proxy` objects for imports.
pub struct TestHost {
    pub state: Arc<HostState>,
}

impl TestHost {
    pub fn new() -> (TestHost, Arc<HostState>) {
        let state = Arc::new(HostState::default());
        (
            TestHost {
                state: state.clone(),
            },
            state,
        )
    }
}

impl BridgeHost for TestHost {
    fn compute_vtables(&self, _instance: &Obj, _flags: ExportFlags) -> &'static [InterfaceEntry] {
        &[]
    }

    fn create_proxy(&self, identity: *mut c_void, _flags: ImportFlags) -> Option<Obj> {
        if self.state.refuse_proxies.load(Ordering::Acquire) {
            return None;
        }
        self.state.created.fetch_add(1, Ordering::AcqRel);
        Some(Arc::new(Proxy {
            identity: identity as usize,
        }))
    }

    fn release_proxies(&self, proxies: Vec<Obj>) {
        self.state
            .bulk_released
            .fetch_add(proxies.len() as u32, Ordering::AcqRel);
    }
}

/// Drive enough collection cycles to run deferred finalizers.
pub fn settle() {
    tether_rt::runtime().collect();
    tether_rt::runtime().collect();
}
