//! Lifecycle coordinator.
//!
//! A [`Bridge`] ties one [`BridgeHost`] collaborator to the caches that
//! make wrapper identity stable in both directions:
//!
//! - **export**: managed instance → exported wrapper, memoized per
//!   instance so repeated exports return the same native pointer;
//! - **import**: native identity → managed proxy, deduplicated through
//!   the identity cache with a deterministic winner when two threads
//!   race.
//!
//! Every live imported proxy is additionally discoverable by managed
//! identity through the process-wide proxy registry, which is what the
//! tracker walk and the weak-reference hooks key off.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_core::unknown::{self, OwnedUnknown};
use tether_core::{InterfaceEntry, InterfaceId};
use tether_rt::{finalizers, object_identity, Finalize, Obj};

use crate::abi;
use crate::error::BridgeError;
use crate::exported::{self, ExportFlags, ExportedHolder, ExportedWrapper};
use crate::identity_cache::IdentityCache;
use crate::imported::{ImportFlags, ImportedWrapper};
use crate::tracker;

/// User-supplied collaborator: computes dispatch tables for exports and
/// materializes proxies for imports.
pub trait BridgeHost: Send + Sync + 'static {
    /// Interface entries the exported wrapper should answer for
    /// `instance`. The slice must outlive every wrapper built from it.
    fn compute_vtables(&self, instance: &Obj, flags: ExportFlags) -> &'static [InterfaceEntry];

    /// Build the managed proxy standing for `identity`, or `None` to
    /// refuse the import.
    fn create_proxy(&self, identity: *mut c_void, flags: ImportFlags) -> Option<Obj>;

    /// Bulk-release proxies gathered by end-of-tracking teardown.
    fn release_proxies(&self, proxies: Vec<Obj>) {
        drop(proxies);
    }
}

/// One coordinator instance: a host plus its two memoization caches.
pub struct Bridge {
    id: u64,
    host: Arc<dyn BridgeHost>,
    exports: Mutex<FxHashMap<usize, Weak<ExportedHolder>>>,
    imports: IdentityCache,
    /// Back-reference handed to wrappers, which hold the bridge strongly
    /// until released.
    self_ref: Weak<Bridge>,
}

static BRIDGE_IDS: AtomicU64 = AtomicU64::new(1);

impl Bridge {
    /// Build a bridge around `host`.
    pub fn new(host: impl BridgeHost) -> Arc<Bridge> {
        Arc::new_cyclic(|self_ref| Bridge {
            id: BRIDGE_IDS.fetch_add(1, Ordering::Relaxed),
            host: Arc::new(host),
            exports: Mutex::new(FxHashMap::default()),
            imports: IdentityCache::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn shared(&self) -> Arc<Bridge> {
        self.self_ref.upgrade().expect("bridge outlived its allocation")
    }

    /// Process-unique id, used by weak-reference tokens to find their
    /// way back to the owning bridge.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn host(&self) -> &Arc<dyn BridgeHost> {
        &self.host
    }

    pub(crate) fn imports(&self) -> &IdentityCache {
        &self.imports
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Export `instance`, returning its base interface pointer with one
    /// added reference. Repeated exports of the same instance return the
    /// same pointer.
    pub fn export(&self, instance: &Obj, flags: ExportFlags) -> Result<*mut c_void, BridgeError> {
        let key = object_identity(instance);

        let holder = match self.lookup_export(key) {
            Some(existing) => existing,
            None => self.create_export(key, instance, flags),
        };

        holder.add_ref();
        holder
            .unknown_ptr()
            .ok_or(BridgeError::InterfaceNotSupported)
    }

    fn lookup_export(&self, key: usize) -> Option<Arc<ExportedHolder>> {
        self.exports.lock().get(&key).and_then(Weak::upgrade)
    }

    /// Slow path: build the wrapper outside the memo lock (the host
    /// callback may re-enter the bridge), then race to install it. The
    /// loser discards its block.
    fn create_export(&self, key: usize, instance: &Obj, flags: ExportFlags) -> Arc<ExportedHolder> {
        let entries = self.host.compute_vtables(instance, flags);
        let wrapper = ExportedWrapper::allocate(entries, flags);

        let mut exports = self.exports.lock();
        if let Some(existing) = exports.get(&key).and_then(Weak::upgrade) {
            drop(exports);
            exported::discard_unregistered(wrapper);
            return existing;
        }

        let holder = ExportedHolder::install(wrapper, instance.clone());
        exports.insert(key, Arc::downgrade(&holder));
        drop(exports);

        // The holder must stay reachable while the instance is reachable
        // from outside the bridge. Holders themselves keep the instance
        // alive, so "dead" here means only holder-contributed references
        // remain; past that point the wrapper's rootedness alone decides
        // the holder's fate.
        let instance_weak = Arc::downgrade(instance);
        let anchor = holder.clone();
        finalizers().register(
            move || instance_weak.strong_count() <= exported::internal_holds(key),
            move || {
                let _ = &anchor;
                Finalize::Done
            },
        );

        tracing::debug!(instance = key, bridge = self.id, "instance exported");
        holder
    }

    /// The base pointer a previous export of `instance` produced, if the
    /// holder is still alive. Does not add a reference.
    pub(crate) fn exported_unknown_for(&self, instance: &Obj) -> Option<*mut c_void> {
        self.lookup_export(object_identity(instance))
            .and_then(|holder| holder.unknown_ptr())
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Import the native object behind `external`, returning its managed
    /// proxy. Non-unique imports of the same identity return the same
    /// proxy.
    pub fn import(
        &self,
        external: *mut c_void,
        flags: ImportFlags,
    ) -> Result<Obj, BridgeError> {
        self.import_internal(external, std::ptr::null_mut(), flags, None)
    }

    /// Import `external` using a caller-built proxy object instead of
    /// asking the host for one. Fails if `proxy` is already bound to a
    /// different identity.
    pub fn import_with_proxy(
        &self,
        external: *mut c_void,
        flags: ImportFlags,
        proxy: Obj,
    ) -> Result<Obj, BridgeError> {
        self.import_internal(external, std::ptr::null_mut(), flags, Some(proxy))
    }

    /// Aggregation import: `inner` carries one reference the wrapper
    /// takes ownership of and releases at teardown.
    pub fn import_aggregated(
        &self,
        external: *mut c_void,
        flags: ImportFlags,
        proxy: Obj,
        inner: *mut c_void,
    ) -> Result<Obj, BridgeError> {
        self.import_internal(external, inner, flags, Some(proxy))
    }

    fn import_internal(
        &self,
        external: *mut c_void,
        inner_maybe: *mut c_void,
        flags: ImportFlags,
        proxy_maybe: Option<Obj>,
    ) -> Result<Obj, BridgeError> {
        if external.is_null() {
            return Err(BridgeError::NullArgument("external"));
        }
        if !inner_maybe.is_null() && !flags.contains(ImportFlags::AGGREGATION) {
            return Err(BridgeError::InnerRequiresAggregation);
        }

        let (identity, inner, mut tracker_maybe) =
            determine_identity_and_inner(external, inner_maybe, flags)?;
        let identity_ptr = identity.as_ptr();

        // Unique instances are always built fresh and never cached.
        if flags.contains(ImportFlags::UNIQUE_INSTANCE) {
            return self.create_and_register(identity_ptr, inner, flags, &mut tracker_maybe);
        }

        // A live cached proxy wins over everything else.
        if let Some(cached) = self.imports.find(identity_ptr as usize) {
            tracing::trace!(identity = identity_ptr as usize, "import cache hit");
            return Ok(cached);
        }

        if let Some(proxy) = proxy_maybe {
            return self.register_proxy(identity_ptr, inner, proxy, flags, &mut tracker_maybe);
        }

        // The identity may be one of this bridge's own exports; hand the
        // wrapped object straight back rather than proxying a proxy. The
        // pointer comparison guards against an export from a different
        // bridge with the same wrapped object.
        if flags.contains(ImportFlags::UNWRAP) {
            if let Some(wrapper) = unsafe { abi::dispatch_from_unknown(identity_ptr) } {
                if let Some(unwrapped) = unsafe { (*wrapper).wrapped_object() } {
                    if self.exported_unknown_for(&unwrapped) == Some(identity_ptr) {
                        return Ok(unwrapped);
                    }
                }
            }
        }

        self.create_and_register(identity_ptr, inner, flags, &mut tracker_maybe)
    }

    fn create_and_register(
        &self,
        identity: *mut c_void,
        inner: *mut c_void,
        flags: ImportFlags,
        tracker_maybe: &mut Option<OwnedUnknown>,
    ) -> Result<Obj, BridgeError> {
        let proxy = self
            .host
            .create_proxy(identity, flags)
            .ok_or(BridgeError::ProxyCreationFailed)?;
        self.register_proxy(identity, inner, proxy, flags, tracker_maybe)
    }

    fn register_proxy(
        &self,
        identity: *mut c_void,
        inner: *mut c_void,
        proxy: Obj,
        flags: ImportFlags,
        tracker_maybe: &mut Option<OwnedUnknown>,
    ) -> Result<Obj, BridgeError> {
        let wrapper =
            ImportedWrapper::create(identity, inner, &self.shared(), &proxy, flags, tracker_maybe);

        let (actual_wrapper, actual_proxy) = if wrapper.is_unique_instance() {
            (wrapper, proxy)
        } else {
            let (winner, winner_proxy) =
                self.imports.get_or_add(identity as usize, &wrapper, &proxy);
            if !Arc::ptr_eq(&winner, &wrapper) {
                // Lost the identity race; the cached pair stands and this
                // wrapper's native references are surrendered.
                tracing::trace!(identity = identity as usize, "import race lost");
                wrapper.release();
            }
            (winner, winner_proxy)
        };

        register_wrapper_for_proxy(actual_wrapper, actual_proxy)
    }
}

fn determine_identity_and_inner(
    external: *mut c_void,
    inner_maybe: *mut c_void,
    flags: ImportFlags,
) -> Result<(OwnedUnknown, *mut c_void, Option<OwnedUnknown>), BridgeError> {
    let tracker_inner_scenario =
        flags.contains(ImportFlags::TRACKER_OBJECT) && flags.contains(ImportFlags::AGGREGATION);

    let mut tracker_maybe = None;
    let mut check_for_identity = external;

    if tracker_inner_scenario {
        // The supplied pointer can be the aggregation inner, and a
        // base-interface query on an inner does not produce the true
        // identity. A tracker-interface query does reach the outer, so
        // identity is computed from there; the reference is kept for the
        // wrapper so the interface is queried exactly once.
        if let Ok(tracker_ptr) =
            unsafe { unknown::query_interface(external, &tracker::TRACKER_IID) }
        {
            let guard = unsafe { OwnedUnknown::adopt(tracker_ptr) };
            check_for_identity = guard.as_ptr();
            tracker_maybe = Some(guard);
        }
    }

    let identity = unsafe { unknown::query_interface(check_for_identity, &InterfaceId::UNKNOWN) }
        .map_err(BridgeError::NativeFailure)?;
    let identity = unsafe { OwnedUnknown::adopt(identity) };

    let mut inner = inner_maybe;
    if inner_maybe.is_null()
        && check_for_identity != external
        && external != identity.as_ptr()
        && tracker_inner_scenario
    {
        // The supplied pointer turned out to be the inner.
        inner = external;
    }

    Ok((identity, inner, tracker_maybe))
}

// =============================================================================
// Proxy registry (managed identity → wrapper)
// =============================================================================

fn proxy_wrappers() -> &'static DashMap<usize, Arc<ImportedWrapper>> {
    static REGISTRY: OnceLock<DashMap<usize, Arc<ImportedWrapper>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Bind `wrapper` to its proxy in the reverse registry and, for tracker
/// wrappers, the global tracking set. Registration must complete before
/// the proxy reaches user code or a collection could miss part of the
/// reference graph.
fn register_wrapper_for_proxy(
    wrapper: Arc<ImportedWrapper>,
    proxy: Obj,
) -> Result<Obj, BridgeError> {
    debug_assert!(
        wrapper
            .resolve_proxy()
            .map(|p| object_identity(&p) == object_identity(&proxy))
            .unwrap_or(false),
        "wrapper proxy handle does not resolve to the registered proxy"
    );

    let key = object_identity(&proxy);
    let mut inserted = false;
    match proxy_wrappers().entry(key) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if Arc::ptr_eq(entry.get(), &wrapper) {
                // Another thread registered the same pair; nothing to do.
            } else if entry.get().resolve_proxy().is_none() {
                // Stale binding: the previous proxy died and this
                // allocation reuses its address before the finalizer ran.
                // The dead wrapper's cleanup no longer matches this entry
                // once replaced.
                entry.insert(wrapper.clone());
                inserted = true;
            } else {
                // The proxy already stands for a different identity.
                drop(entry);
                wrapper.release();
                return Err(BridgeError::ProxyAlreadyRegistered);
            }
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(wrapper.clone());
            inserted = true;
        }
    }

    if inserted {
        // Teardown path for this binding: once the proxy dies, drop the
        // registry entry (if it is still ours) and release the wrapper.
        let proxy_weak = Arc::downgrade(&proxy);
        let finalized = wrapper.clone();
        finalizers().register(
            move || proxy_weak.strong_count() == 0,
            move || {
                proxy_wrappers().remove_if(&key, |_, v| Arc::ptr_eq(v, &finalized));
                finalized.release();
                Finalize::Done
            },
        );
    }

    // Tracker wrappers join the walk set even when another thread did
    // the registration: the wrapper must be walkable before this call
    // returns. The set deduplicates.
    if wrapper.is_tracker_wrapper() {
        tracker::track_wrapper(&wrapper);
    }

    Ok(proxy)
}

/// The wrapper registered for a managed proxy, if any.
pub(crate) fn wrapper_for_proxy(proxy: &Obj) -> Option<Arc<ImportedWrapper>> {
    proxy_wrappers()
        .get(&object_identity(proxy))
        .map(|entry| entry.clone())
}

/// Round-trip query: the native base pointer behind a managed proxy,
/// with one added reference.
pub fn native_for_object(proxy: &Obj) -> Option<OwnedUnknown> {
    native_for_object_with_interface(proxy, &InterfaceId::UNKNOWN).map(|(ptr, _)| ptr)
}

/// Like [`native_for_object`] but for an arbitrary interface, also
/// reporting the owning bridge's id.
pub(crate) fn native_for_object_with_interface(
    proxy: &Obj,
    iid: &InterfaceId,
) -> Option<(OwnedUnknown, u64)> {
    let wrapper = wrapper_for_proxy(proxy)?;
    let identity = wrapper.identity_ptr();
    if identity.is_null() {
        return None;
    }
    let ptr = unsafe { unknown::query_interface(identity, iid) }.ok()?;
    Some((unsafe { OwnedUnknown::adopt(ptr) }, wrapper.bridge_id()))
}
