//! Reference-tracker protocol.
//!
//! The bridge plays two roles against a host's reference-tracking
//! runtime:
//!
//! - **target**: exported wrappers install a tracker-target table (see
//!   [`crate::abi`]) so the host can hold, peg, and unpeg them;
//! - **host**: the bridge exposes a singleton host object the tracker
//!   manager calls to trigger collections, end per-thread tracking,
//!   round-trip identities into peggable targets, and account memory
//!   pressure.
//!
//! [`TrackerRegistry`] owns the process-wide pieces: the manager pointer
//! (set once) and the weak set of every tracker-aware imported wrapper
//! that the collection-pause callbacks walk; the global pegging flag
//! lives beside it. Pause callbacks only enumerate that set; they never
//! touch the identity caches.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tether_core::status::{self, RawStatus};
use tether_core::unknown::{self, OwnedUnknown, UnknownVtbl};
use tether_core::InterfaceId;
use tether_rt::{handles, runtime, CollectionHooks, Handle, Obj};

use crate::abi;
pub use crate::abi::TrackerTargetVtbl;
use crate::coordinator::Bridge;
use crate::imported::ImportedWrapper;
use crate::registry;
use crate::weak_set::WeakSet;

// =============================================================================
// Interface identifiers
// =============================================================================

/// Tracker objects: native objects that can report their outbound
/// cross-heap references.
pub const TRACKER_IID: InterfaceId = InterfaceId::new(
    0x8d2e_4bc1,
    0x91a7,
    0x4f05,
    [0xb3, 0x6a, 0x2f, 0xc8, 0x09, 0x5e, 0xd1, 0x37],
);

/// Tracker targets: exported wrappers the tracker runtime can hold and
/// peg.
pub const TRACKER_TARGET_IID: InterfaceId = InterfaceId::new(
    0x6a1f_83d9,
    0x2c44,
    0x4b7e,
    [0x8e, 0x51, 0x0d, 0x96, 0x7a, 0x33, 0xc2, 0xf8],
);

/// The callback a graph walk feeds discovered targets into.
pub const FIND_TARGETS_CALLBACK_IID: InterfaceId = InterfaceId::new(
    0xb4c8_1e72,
    0x60d3,
    0x49af,
    [0xa1, 0x2b, 0x84, 0x5c, 0xee, 0x07, 0x96, 0x4a],
);

/// The host object the bridge exposes to the tracker manager.
pub const TRACKER_HOST_IID: InterfaceId = InterfaceId::new(
    0xf15d_9c36,
    0x7e88,
    0x4203,
    [0x9f, 0x67, 0x5b, 0x1a, 0xd4, 0x40, 0x28, 0xe1],
);

/// Flag bit of `disconnect_unused_sources`: the process is suspending,
/// collect the older generations synchronously.
pub const DISCONNECT_SUSPEND: u32 = 0x0000_0001;

// =============================================================================
// Raw protocol vtables
// =============================================================================

/// Tracker object table.
#[repr(C)]
pub struct TrackerVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// A managed source is now connected to this tracker.
    pub connect_from_source: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// The managed source is going away.
    pub disconnect_from_source: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// Report outbound targets into the supplied callback.
    pub find_targets: unsafe extern "C" fn(*mut c_void, *mut c_void) -> RawStatus,
    /// Fetch the process-wide tracker manager.
    pub get_manager: unsafe extern "C" fn(*mut c_void, *mut *mut c_void) -> RawStatus,
    /// The managed source takes one protocol reference.
    pub add_ref_from_source: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// The managed source drops one protocol reference.
    pub release_from_source: unsafe extern "C" fn(*mut c_void) -> RawStatus,
}

/// Tracker manager table.
#[repr(C)]
pub struct TrackerManagerVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// A tracking cycle is starting.
    pub tracking_started: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// The walk finished; nonzero argument reports failure.
    pub find_targets_completed: unsafe extern "C" fn(*mut c_void, i32) -> RawStatus,
    /// The tracking cycle is over.
    pub tracking_completed: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// Install the bridge's host object.
    pub set_tracker_host: unsafe extern "C" fn(*mut c_void, *mut c_void) -> RawStatus,
}

/// Find-targets callback table (implemented by the bridge).
#[repr(C)]
pub struct FindTargetsCallbackVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// One discovered target, as a tracker-target interface pointer.
    pub found_target: unsafe extern "C" fn(*mut c_void, *mut c_void) -> RawStatus,
}

/// Host table (implemented by the bridge).
#[repr(C)]
pub struct TrackerHostVtbl {
    /// Base slots.
    pub base: UnknownVtbl,
    /// Trigger a collection; see [`DISCONNECT_SUSPEND`].
    pub disconnect_unused_sources: unsafe extern "C" fn(*mut c_void, u32) -> RawStatus,
    /// Reclaim already-disconnected sources.
    pub release_disconnected_sources: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// The calling thread is done participating in tracking.
    pub notify_end_of_tracking_on_thread: unsafe extern "C" fn(*mut c_void) -> RawStatus,
    /// Round-trip an identity into a peggable tracker target.
    pub get_tracker_target:
        unsafe extern "C" fn(*mut c_void, *mut c_void, *mut *mut c_void) -> RawStatus,
    /// Account native memory attributable to managed objects.
    pub add_memory_pressure: unsafe extern "C" fn(*mut c_void, u64) -> RawStatus,
    /// Withdraw previously added pressure.
    pub remove_memory_pressure: unsafe extern "C" fn(*mut c_void, u64) -> RawStatus,
}

// =============================================================================
// Checked calls into foreign tracker objects
// =============================================================================

#[inline]
unsafe fn tracker_vtbl<'a>(ptr: *mut c_void) -> &'a TrackerVtbl {
    &**(ptr as *mut *const TrackerVtbl)
}

#[inline]
unsafe fn manager_vtbl<'a>(ptr: *mut c_void) -> &'a TrackerManagerVtbl {
    &**(ptr as *mut *const TrackerManagerVtbl)
}

pub(crate) unsafe fn connect_from_source(tracker: *mut c_void) -> RawStatus {
    (tracker_vtbl(tracker).connect_from_source)(tracker)
}

pub(crate) unsafe fn disconnect_from_source(tracker: *mut c_void) -> RawStatus {
    (tracker_vtbl(tracker).disconnect_from_source)(tracker)
}

pub(crate) unsafe fn find_targets(tracker: *mut c_void, callback: *mut c_void) -> RawStatus {
    (tracker_vtbl(tracker).find_targets)(tracker, callback)
}

pub(crate) unsafe fn get_manager(tracker: *mut c_void) -> Result<NonNull<c_void>, RawStatus> {
    let mut out: *mut c_void = std::ptr::null_mut();
    let rc = (tracker_vtbl(tracker).get_manager)(tracker, &mut out);
    match NonNull::new(out) {
        Some(nn) if status::is_ok(rc) => Ok(nn),
        _ => Err(if status::is_ok(rc) { status::FAIL } else { rc }),
    }
}

pub(crate) unsafe fn add_ref_from_source(tracker: *mut c_void) -> RawStatus {
    (tracker_vtbl(tracker).add_ref_from_source)(tracker)
}

pub(crate) unsafe fn release_from_source(tracker: *mut c_void) -> RawStatus {
    (tracker_vtbl(tracker).release_from_source)(tracker)
}

unsafe fn manager_tracking_started(manager: *mut c_void) -> RawStatus {
    (manager_vtbl(manager).tracking_started)(manager)
}

unsafe fn manager_find_targets_completed(manager: *mut c_void, failed: bool) -> RawStatus {
    (manager_vtbl(manager).find_targets_completed)(manager, failed as i32)
}

unsafe fn manager_tracking_completed(manager: *mut c_void) -> RawStatus {
    (manager_vtbl(manager).tracking_completed)(manager)
}

unsafe fn manager_set_host(manager: *mut c_void, host: *mut c_void) -> RawStatus {
    (manager_vtbl(manager).set_tracker_host)(manager, host)
}

// =============================================================================
// Context tokens
// =============================================================================

/// Stable opaque token identifying the calling thread's tracking
/// context. Wrappers record it at creation; release-for-thread matches
/// on it.
pub(crate) fn context_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|cell| cell as *const u8 as usize)
}

// =============================================================================
// TrackerRegistry
// =============================================================================

/// Conservative rooting of every tracker-referenced wrapper; set when a
/// walk fails, cleared when the next walk starts. A bare static so the
/// rootedness predicates running inside a pause can read it without
/// initializing anything.
static GLOBAL_PEGGING: AtomicBool = AtomicBool::new(false);

/// Process-wide tracker state.
pub(crate) struct TrackerRegistry {
    /// The tracker manager, once discovered. Owns one reference.
    manager: AtomicUsize,
    /// Proxy handle of the wrapper currently being walked.
    current_root: AtomicU64,
    /// Every live tracker-aware imported wrapper.
    pub(crate) wrappers: WeakSet<ImportedWrapper>,
}

impl TrackerRegistry {
    fn new() -> Self {
        Self {
            manager: AtomicUsize::new(0),
            current_root: AtomicU64::new(0),
            wrappers: WeakSet::new(),
        }
    }

    fn manager_ptr(&self) -> *mut c_void {
        self.manager.load(Ordering::Acquire) as *mut c_void
    }

    /// First contact with a tracker object: discover the manager and
    /// hand it the host, exactly once per process.
    pub(crate) fn on_tracker_found(&self, tracker: *mut c_void) {
        if self.manager.load(Ordering::Acquire) != 0 {
            return;
        }
        let manager = match unsafe { get_manager(tracker) } {
            Ok(ptr) => ptr.as_ptr(),
            Err(rc) => {
                tracing::warn!(status = rc, "tracker manager discovery failed");
                return;
            }
        };
        unsafe { manager_set_host(manager, host_ptr()) };
        if self
            .manager
            .compare_exchange(0, manager as usize, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread won the discovery race; drop our reference.
            unsafe { unknown::release(manager) };
        } else {
            tracing::debug!(manager = manager as usize, "tracker manager registered");
        }
    }

    /// A tracker-aware wrapper was created around `tracker`: connect and
    /// take the two protocol references the teardown ledger expects (the
    /// runtime's implied base-interface ownership plus the tracker
    /// interface itself).
    pub(crate) fn after_wrapper_created(&self, tracker: *mut c_void) {
        unsafe {
            connect_from_source(tracker);
            add_ref_from_source(tracker);
            add_ref_from_source(tracker);
        }
    }

    /// The wrapper around `tracker` did not survive collection.
    pub(crate) fn before_wrapper_finalized(&self, tracker: *mut c_void) {
        unsafe {
            disconnect_from_source(tracker);
        }
    }

    /// Pause callback: walk every tracked wrapper's outbound references.
    /// A single failed walk aborts the pass, forces global pegging, and
    /// is reported to the manager.
    pub(crate) fn walk_tracker_objects(&self) {
        // Each cycle starts optimistic; failure below re-enables it.
        GLOBAL_PEGGING.store(false, Ordering::Release);

        let mut walk_failed = false;
        for entry in self.wrappers.iter() {
            let Some(wrapper) = entry.upgrade() else {
                continue;
            };
            let tracker = wrapper.tracker_object();
            if tracker.is_null() {
                continue;
            }
            let Some(proxy_handle) = wrapper.proxy_handle() else {
                continue;
            };
            self.current_root.store(proxy_handle.raw(), Ordering::Release);
            let rc = unsafe { find_targets(tracker, callback_ptr()) };
            self.current_root.store(0, Ordering::Release);
            if rc != status::OK {
                walk_failed = true;
                break;
            }
        }

        if walk_failed {
            GLOBAL_PEGGING.store(true, Ordering::Release);
        }
        let manager = self.manager_ptr();
        if !manager.is_null() {
            unsafe { manager_find_targets_completed(manager, walk_failed) };
        }
    }

    /// Pause callback: notify trackers whose proxies did not survive.
    pub(crate) fn detach_unpromoted(&self) {
        for entry in self.wrappers.iter() {
            let Some(wrapper) = entry.upgrade() else {
                continue;
            };
            let tracker = wrapper.tracker_object();
            if tracker.is_null() {
                continue;
            }
            let promoted = wrapper
                .proxy_handle()
                .map(|h| runtime().is_promoted(h))
                .unwrap_or(false);
            if !promoted {
                self.before_wrapper_finalized(tracker);
            }
        }
    }

    /// The proxy currently being walked, for the find-targets callback.
    fn current_root_proxy(&self) -> Option<Obj> {
        Handle::from_raw(self.current_root.load(Ordering::Acquire))
            .and_then(|h| handles().resolve(h))
    }

    /// The calling thread is done with reference tracking: disconnect
    /// every wrapper recorded against its context token and hand the
    /// surviving proxies to the bridge host for bulk release, outside the
    /// modification lock.
    pub(crate) fn release_for_thread(&self, bridge: &Arc<Bridge>) {
        let token = context_token();
        let mut proxies: Vec<Obj> = Vec::new();
        self.wrappers.with_modification_lock(|| {
            for entry in self.wrappers.iter() {
                let Some(wrapper) = entry.upgrade() else {
                    continue;
                };
                if wrapper.context_token() != Some(token) {
                    continue;
                }
                if let Some(proxy) = wrapper.resolve_proxy() {
                    proxies.push(proxy);
                }
                wrapper.disconnect_tracker();
            }
        });
        tracing::debug!(count = proxies.len(), "releasing tracked proxies for thread");
        bridge.host().release_proxies(proxies);
    }
}

/// The global tracker registry. First use also registers the collection
/// hooks with the runtime.
pub(crate) fn tracker_registry() -> &'static TrackerRegistry {
    static REGISTRY: OnceLock<TrackerRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        runtime().register_hooks(Arc::new(TrackerHooks));
        TrackerRegistry::new()
    })
}

/// Whether conservative global pegging is in force.
pub(crate) fn is_global_pegging() -> bool {
    GLOBAL_PEGGING.load(Ordering::Acquire)
}

/// Register a tracker-aware wrapper for graph walking.
pub(crate) fn track_wrapper(wrapper: &Arc<ImportedWrapper>) {
    tracker_registry().wrappers.add(Arc::downgrade(wrapper));
}

/// Collection hooks bridging the runtime's pause into the registry.
struct TrackerHooks;

impl CollectionHooks for TrackerHooks {
    fn tracking_started(&self) {
        let registry = tracker_registry();
        let manager = registry.manager_ptr();
        if !manager.is_null() {
            unsafe { manager_tracking_started(manager) };
        }
        registry.walk_tracker_objects();
    }

    fn detach_unpromoted(&self) {
        tracker_registry().detach_unpromoted();
    }

    fn tracking_completed(&self) {
        let manager = tracker_registry().manager_ptr();
        if !manager.is_null() {
            unsafe { manager_tracking_completed(manager) };
        }
    }
}

// =============================================================================
// Find-targets callback singleton
// =============================================================================

#[repr(C)]
struct CallbackObject {
    vtbl: *const FindTargetsCallbackVtbl,
}

unsafe impl Sync for CallbackObject {}

static CALLBACK_VTBL: FindTargetsCallbackVtbl = FindTargetsCallbackVtbl {
    base: UnknownVtbl {
        query_interface: callback_query_interface,
        add_ref: untracked_add_ref,
        release: untracked_release,
    },
    found_target: callback_found_target,
};

static CALLBACK: CallbackObject = CallbackObject {
    vtbl: &CALLBACK_VTBL,
};

pub(crate) fn callback_ptr() -> *mut c_void {
    &CALLBACK as *const CallbackObject as *mut c_void
}

unsafe extern "C" fn callback_query_interface(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if iid.is_null() || out.is_null() {
        return status::INVALID_ARGUMENT;
    }
    if *iid == FIND_TARGETS_CALLBACK_IID || *iid == InterfaceId::UNKNOWN {
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

// Singleton lifetime is the process; counts are meaningless.
unsafe extern "C" fn untracked_add_ref(_this: *mut c_void) -> u32 {
    1
}

unsafe extern "C" fn untracked_release(_this: *mut c_void) -> u32 {
    1
}

/// A walk reported one outbound target. Record a cross-heap edge from
/// the root proxy being walked to the target's wrapped object, when the
/// target belongs to this wrapper family.
unsafe extern "C" fn callback_found_target(_this: *mut c_void, target: *mut c_void) -> RawStatus {
    if target.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let registry = tracker_registry();
    let Some(root) = registry.current_root_proxy() else {
        return status::OK;
    };
    let Some(wrapper) = abi::dispatch_from_unknown(target) else {
        // Foreign target; nothing to record.
        return status::OK;
    };
    if let Some(wrapped) = (*wrapper).wrapped_object() {
        runtime().record_cross_reference(&root, wrapped);
    }
    status::OK
}

// =============================================================================
// Host singleton
// =============================================================================

#[repr(C)]
struct HostObject {
    vtbl: *const TrackerHostVtbl,
}

unsafe impl Sync for HostObject {}

static HOST_VTBL: TrackerHostVtbl = TrackerHostVtbl {
    base: UnknownVtbl {
        query_interface: host_query_interface,
        add_ref: untracked_add_ref,
        release: untracked_release,
    },
    disconnect_unused_sources: host_disconnect_unused_sources,
    release_disconnected_sources: host_release_disconnected_sources,
    notify_end_of_tracking_on_thread: host_notify_end_of_tracking,
    get_tracker_target: host_get_tracker_target,
    add_memory_pressure: host_add_memory_pressure,
    remove_memory_pressure: host_remove_memory_pressure,
};

static HOST: HostObject = HostObject { vtbl: &HOST_VTBL };

/// The singleton host object handed to the tracker manager.
pub(crate) fn host_ptr() -> *mut c_void {
    &HOST as *const HostObject as *mut c_void
}

fn guard_status(body: impl FnOnce() -> RawStatus) -> RawStatus {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)).unwrap_or(status::FAIL)
}

unsafe extern "C" fn host_query_interface(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if iid.is_null() || out.is_null() {
        return status::INVALID_ARGUMENT;
    }
    if *iid == TRACKER_HOST_IID || *iid == InterfaceId::UNKNOWN {
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn host_disconnect_unused_sources(_this: *mut c_void, flags: u32) -> RawStatus {
    guard_status(|| {
        if flags & DISCONNECT_SUSPEND != 0 {
            runtime().collect_background();
        } else {
            runtime().collect();
        }
        status::OK
    })
}

unsafe extern "C" fn host_release_disconnected_sources(_this: *mut c_void) -> RawStatus {
    // Waiting on pending finalizers here can deadlock against a host
    // that has stopped pumping this thread; disconnected sources are
    // reclaimed by the ordinary finalization sweep instead.
    status::OK
}

unsafe extern "C" fn host_notify_end_of_tracking(_this: *mut c_void) -> RawStatus {
    guard_status(
        || match registry::release_external_objects_from_current_thread() {
            Ok(()) => status::OK,
            Err(err) => err.to_raw_status(),
        },
    )
}

unsafe extern "C" fn host_get_tracker_target(
    _this: *mut c_void,
    unknown_ptr: *mut c_void,
    out: *mut *mut c_void,
) -> RawStatus {
    guard_status(|| unsafe {
        if unknown_ptr.is_null() || out.is_null() {
            return status::INVALID_ARGUMENT;
        }
        let identity = match unknown::query_interface(unknown_ptr, &InterfaceId::UNKNOWN) {
            Ok(ptr) => OwnedUnknown::adopt(ptr),
            Err(_) => return status::INVALID_CAST,
        };
        let target = match registry::get_or_create_tracker_target(identity.as_ptr()) {
            Ok(ptr) => ptr,
            Err(err) => return err.to_raw_status(),
        };
        // Exchange the base reference for the tracker-target interface.
        let target = OwnedUnknown::adopt(
            NonNull::new(target).expect("tracker target export returned null"),
        );
        match unknown::query_interface(target.as_ptr(), &TRACKER_TARGET_IID) {
            Ok(ptr) => {
                *out = ptr.as_ptr();
                status::OK
            }
            Err(rc) => rc,
        }
    })
}

unsafe extern "C" fn host_add_memory_pressure(_this: *mut c_void, bytes: u64) -> RawStatus {
    guard_status(|| {
        runtime().add_memory_pressure(bytes);
        status::OK
    })
}

unsafe extern "C" fn host_remove_memory_pressure(_this: *mut c_void, bytes: u64) -> RawStatus {
    guard_status(|| {
        runtime().remove_memory_pressure(bytes);
        status::OK
    })
}
