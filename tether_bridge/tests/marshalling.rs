//! Global registration, ambient marshalling, weak-reference bridging,
//! and per-thread tracker teardown.
//!
//! Registration slots are process-wide, so this binary registers one
//! marshalling bridge and one tracker-support bridge up front and every
//! test goes through them.

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use common::{settle, HostState, Instance, NativeObject, TestHost, TrackerObject};
use tether_bridge::weakref::{
    self, WeakReferenceSourceVtbl, WeakReferenceVtbl, WEAK_REFERENCE_SOURCE_IID,
};
use tether_bridge::{registry, Bridge, BridgeError, ImportFlags};
use tether_core::status::{self, RawStatus};
use tether_core::unknown::{self, UnknownVtbl};
use tether_core::InterfaceId;
use tether_rt::{object_identity, Obj};

struct Global {
    tracker_state: Arc<HostState>,
    marshal_state: Arc<HostState>,
}

fn global() -> &'static Global {
    static GLOBAL: OnceLock<Global> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let (tracker_host, tracker_state) = TestHost::new();
        let (marshal_host, marshal_state) = TestHost::new();
        registry::register_for_tracker_support(Bridge::new(tracker_host)).unwrap();
        registry::register_for_marshalling(Bridge::new(marshal_host)).unwrap();
        Global {
            tracker_state,
            marshal_state,
        }
    })
}

#[test]
fn test_registration_slots_fill_once() {
    global();
    let (extra_host, _) = TestHost::new();
    assert_eq!(
        registry::register_for_marshalling(Bridge::new(extra_host)),
        Err(BridgeError::AlreadyRegistered("marshalling"))
    );
    let (extra_host, _) = TestHost::new();
    assert_eq!(
        registry::register_for_tracker_support(Bridge::new(extra_host)),
        Err(BridgeError::AlreadyRegistered("tracker-support"))
    );
}

#[test]
fn test_marshal_round_trip_unwraps_to_same_instance() {
    global();
    let instance: Obj = Arc::new(Instance { tag: 70 });

    let native = registry::native_for_instance(&instance).unwrap();
    let back = registry::instance_for_native(native).unwrap();
    assert_eq!(object_identity(&back), object_identity(&instance));

    unsafe { unknown::release(native) };
    drop((instance, back));
    settle();
}

#[test]
fn test_marshal_import_builds_proxy_and_round_trips() {
    let g = global();
    let native = NativeObject::new();

    let proxy = registry::instance_for_native(native.ptr()).unwrap();
    assert!(g.marshal_state.created.load(Ordering::Acquire) >= 1);

    // Managed identity → native identity round trip adds one reference.
    let round = tether_bridge::native_for_object(&proxy).unwrap();
    assert_eq!(round.as_ptr(), native.ptr());
    drop(round);

    drop(proxy);
    settle();
    assert_eq!(native.refs(), 1);
}

#[test]
fn test_interface_targeted_export() {
    global();
    let instance: Obj = Arc::new(Instance { tag: 71 });

    let tagged =
        registry::native_for_instance_with_interface(&instance, &tether_bridge::TAGGED_IID)
            .unwrap();
    assert!(unsafe { tether_bridge::dispatch_from_unknown(tagged) }.is_some());
    unsafe { unknown::release(tagged) };

    let missing = InterfaceId::new(0xaaaa, 1, 1, [1; 8]);
    assert_eq!(
        registry::native_for_instance_with_interface(&instance, &missing),
        Err(BridgeError::InterfaceNotSupported)
    );

    drop(instance);
    settle();
}

#[test]
fn test_tracker_target_round_trip() {
    global();
    let tracker = TrackerObject::new();

    let target_unknown = registry::get_or_create_tracker_target(tracker.ptr()).unwrap();
    // The result is one of our exported wrappers and answers the
    // tracker-target interface.
    assert!(unsafe { tether_bridge::dispatch_from_unknown(target_unknown) }.is_some());
    let target = unsafe {
        unknown::query_interface(
            target_unknown,
            &tether_bridge::tracker::TRACKER_TARGET_IID,
        )
        .unwrap()
        .as_ptr()
    };

    unsafe {
        unknown::release(target);
        unknown::release(target_unknown);
    }
    settle();
    settle();
    assert_eq!(tracker.source_refs(), 0);
    assert_eq!(tracker.refs(), 1);
}

#[test]
fn test_release_external_objects_for_current_thread() {
    let g = global();
    let tracker = TrackerObject::new();

    // Imported on this thread, so its context token matches.
    let proxy = registry::tracker_support_bridge()
        .unwrap()
        .import(tracker.ptr(), ImportFlags::TRACKER_OBJECT)
        .unwrap();
    assert_eq!(tracker.source_refs(), 2);

    let released_before = g.tracker_state.bulk_released.load(Ordering::Acquire);
    registry::release_external_objects_from_current_thread().unwrap();

    // The proxy survived (we hold it) and was handed to the host for
    // bulk release; the tracker connection is gone.
    assert!(g.tracker_state.bulk_released.load(Ordering::Acquire) > released_before);
    assert_eq!(tracker.source_refs(), 0);
    assert_eq!(tracker.refs(), 1);

    drop(proxy);
    settle();
}

#[test]
fn test_release_for_thread_skips_other_contexts() {
    let g = global();
    let tracker = TrackerObject::new();
    let ptr = tracker.ptr() as usize;

    // Imported on another thread: a foreign context token.
    let proxy = std::thread::spawn(move || {
        registry::tracker_support_bridge()
            .unwrap()
            .import(ptr as *mut c_void, ImportFlags::TRACKER_OBJECT)
            .unwrap()
    })
    .join()
    .unwrap();

    let released_before = g.tracker_state.bulk_released.load(Ordering::Acquire);
    registry::release_external_objects_from_current_thread().unwrap();
    assert_eq!(
        g.tracker_state.bulk_released.load(Ordering::Acquire),
        released_before
    );
    // Still connected.
    assert_eq!(tracker.source_refs(), 2);

    drop(proxy);
    settle();
    assert_eq!(tracker.source_refs(), 0);
}

// =============================================================================
// Weak-reference bridging
// =============================================================================

/// Native object that can mint weak-reference tokens for itself.
#[repr(C)]
struct WeakSource {
    vtbl: *const WeakReferenceSourceVtbl,
    refs: AtomicU32,
    token: AtomicUsize,
}

static WEAK_SOURCE_VTBL: WeakReferenceSourceVtbl = WeakReferenceSourceVtbl {
    base: UnknownVtbl {
        query_interface: weak_source_qi,
        add_ref: weak_source_add_ref,
        release: weak_source_release,
    },
    get_weak_reference: weak_source_get_weak_reference,
};

unsafe extern "C" fn weak_source_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN || *iid == WEAK_REFERENCE_SOURCE_IID {
        weak_source_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn weak_source_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const WeakSource);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn weak_source_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const WeakSource);
    obj.refs.fetch_sub(1, Ordering::AcqRel) - 1
}

unsafe extern "C" fn weak_source_get_weak_reference(
    this: *mut c_void,
    out: *mut *mut c_void,
) -> RawStatus {
    let obj = &*(this as *const WeakSource);
    let mut token = obj.token.load(Ordering::Acquire);
    if token == 0 {
        let fresh = Box::into_raw(Box::new(WeakToken {
            vtbl: &WEAK_TOKEN_VTBL,
            refs: AtomicU32::new(0),
            source: this as usize,
        }));
        obj.token.store(fresh as usize, Ordering::Release);
        token = fresh as usize;
    }
    weak_token_add_ref(token as *mut c_void);
    *out = token as *mut c_void;
    status::OK
}

/// The token minted by [`WeakSource`]; resolves to the source while the
/// test keeps it alive.
#[repr(C)]
struct WeakToken {
    vtbl: *const WeakReferenceVtbl,
    refs: AtomicU32,
    source: usize,
}

static WEAK_TOKEN_VTBL: WeakReferenceVtbl = WeakReferenceVtbl {
    base: UnknownVtbl {
        query_interface: weak_token_qi,
        add_ref: weak_token_add_ref,
        release: weak_token_release,
    },
    resolve: weak_token_resolve,
};

unsafe extern "C" fn weak_token_qi(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    if *iid == InterfaceId::UNKNOWN {
        weak_token_add_ref(this);
        *out = this;
        status::OK
    } else {
        *out = std::ptr::null_mut();
        status::INVALID_CAST
    }
}

unsafe extern "C" fn weak_token_add_ref(this: *mut c_void) -> u32 {
    let obj = &*(this as *const WeakToken);
    obj.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "C" fn weak_token_release(this: *mut c_void) -> u32 {
    let obj = &*(this as *const WeakToken);
    obj.refs.fetch_sub(1, Ordering::AcqRel) - 1
}

unsafe extern "C" fn weak_token_resolve(
    this: *mut c_void,
    _iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> RawStatus {
    let obj = &*(this as *const WeakToken);
    let source = obj.source as *mut c_void;
    unknown::add_ref(source);
    *out = source;
    status::OK
}

impl WeakSource {
    fn new() -> Box<WeakSource> {
        Box::new(WeakSource {
            vtbl: &WEAK_SOURCE_VTBL,
            refs: AtomicU32::new(1),
            token: AtomicUsize::new(0),
        })
    }

    fn ptr(&self) -> *mut c_void {
        self as *const WeakSource as *mut c_void
    }
}

impl Drop for WeakSource {
    fn drop(&mut self) {
        let token = self.token.load(Ordering::Acquire);
        if token != 0 {
            drop(unsafe { Box::from_raw(token as *mut WeakToken) });
        }
    }
}

#[test]
fn test_weak_reference_token_round_trip() {
    global();
    let source = WeakSource::new();

    let proxy = registry::instance_for_native(source.ptr()).unwrap();
    assert!(weakref::possibly_native_backed(&proxy));

    let (token, bridge_id) = weakref::native_weak_reference_for(&proxy).unwrap();
    assert_ne!(bridge_id, 0);

    // Dropping the proxy severs the managed side entirely.
    drop(proxy);
    settle();

    // The token re-imports the identity into a fresh proxy.
    let revived = unsafe { weakref::resolve_native_weak_reference(token.as_ptr(), bridge_id) };
    let revived = revived.expect("live native object should re-import");
    assert!(weakref::possibly_native_backed(&revived));

    drop((token, revived));
    settle();
    assert_eq!(source.refs.load(Ordering::Acquire), 1);
}

#[test]
fn test_plain_objects_are_not_native_backed() {
    global();
    let plain: Obj = Arc::new(Instance { tag: 72 });
    assert!(!weakref::possibly_native_backed(&plain));
    assert!(weakref::native_weak_reference_for(&plain).is_none());
}

#[test]
fn test_unknown_bridge_id_resolves_nothing() {
    global();
    let source = WeakSource::new();
    let proxy = registry::instance_for_native(source.ptr()).unwrap();
    let (token, _) = weakref::native_weak_reference_for(&proxy).unwrap();

    assert!(unsafe { weakref::resolve_native_weak_reference(token.as_ptr(), 0) }.is_none());
    assert!(
        unsafe { weakref::resolve_native_weak_reference(token.as_ptr(), u64::MAX) }.is_none()
    );

    drop((token, proxy));
    settle();
}
