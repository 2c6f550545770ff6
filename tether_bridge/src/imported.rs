//! Imported wrappers: managed-facing wrappers around native objects.
//!
//! An [`ImportedWrapper`] records everything needed to tear a native
//! import back down: the identity pointer (a non-owning deduplication
//! key), an optional owned inner pointer for aggregation, two weak
//! handles to the managed proxy (one consulted by the tracker runtime,
//! one gating teardown), and — for tracker-aware imports — the owned
//! connection to the native tracker object.
//!
//! Release is reachable from two independent paths (explicit release and
//! proxy finalization) and every sub-step is guarded by an atomic take,
//! so reaching it twice has no double effects.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tether_core::unknown::{self, OwnedUnknown};
use tether_rt::{handles, Handle, Obj};

use crate::abi;
use crate::coordinator::Bridge;
use crate::tracker::{self, tracker_registry};

bitflags! {
    /// Caller-visible import configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImportFlags: u32 {
        /// Probe the identity for a tracker interface and, when found,
        /// participate in reference tracking.
        const TRACKER_OBJECT = 1;
        /// Build a fresh, uncached wrapper even when one exists.
        const UNIQUE_INSTANCE = 2;
        /// The import participates in aggregation; affects identity
        /// resolution and the tracker reference ledger.
        const AGGREGATION = 4;
        /// If the identity is one of this bridge's own exports, return
        /// the wrapped object directly instead of building a proxy.
        const UNWRAP = 8;
    }
}

/// Tracker-side state of a tracker-aware import.
struct TrackerLink {
    /// The native tracker object; zero once disconnected.
    tracker: AtomicUsize,
    /// Whether this wrapper (not an aggregation peer) owns the tracker
    /// pointer and its protocol reference.
    owns_tracker: bool,
    /// One-shot disconnect guard.
    disconnected: AtomicBool,
    /// Tracking context of the creating thread.
    context_token: usize,
}

/// Managed-facing wrapper around one native identity.
pub struct ImportedWrapper {
    /// Deduplication key; non-owning. Zero after release.
    identity: AtomicUsize,
    /// Owned aggregation inner, released exactly once. Zero when absent.
    inner: AtomicUsize,
    /// Id of the owning bridge, stable across release for weak-reference
    /// token resolution.
    bridge_id: u64,
    /// Owning bridge; dropped on release so a dead wrapper does not pin
    /// its bridge.
    bridge: Mutex<Option<Arc<Bridge>>>,
    /// Weak handle to the proxy, consulted by the tracker runtime.
    proxy_handle: AtomicU64,
    /// Resurrection-tracking weak handle gating teardown.
    proxy_resurrect_handle: AtomicU64,
    unique_instance: bool,
    aggregated_export: bool,
    link: Option<TrackerLink>,
}

impl ImportedWrapper {
    /// Build the wrapper for `identity`, deciding the tracker variant.
    ///
    /// When the flags request tracker participation, a supplied tracker
    /// reference is adopted (aggregation hands one over so the interface
    /// is queried at most once); otherwise the identity is probed for
    /// one.
    pub(crate) fn create(
        identity: *mut c_void,
        inner: *mut c_void,
        bridge: &Arc<Bridge>,
        proxy: &Obj,
        flags: ImportFlags,
        tracker_maybe: &mut Option<OwnedUnknown>,
    ) -> Arc<ImportedWrapper> {
        let mut link = None;
        if flags.contains(ImportFlags::TRACKER_OBJECT) {
            let adopted = tracker_maybe.take().or_else(|| unsafe {
                unknown::query_interface(identity, &tracker::TRACKER_IID)
                    .ok()
                    .map(|ptr| OwnedUnknown::adopt(ptr))
            });
            if let Some(tracker_ref) = adopted {
                let tracker_ptr = tracker_ref.into_raw();
                let registry = tracker_registry();
                registry.on_tracker_found(tracker_ptr);
                registry.after_wrapper_created(tracker_ptr);

                let owns_tracker = if flags.contains(ImportFlags::AGGREGATION) {
                    // Aggregation with a tracker source takes one extra
                    // reference on the outer; balance it here and let the
                    // peer own the tracker pointer.
                    unsafe {
                        tracker::release_from_source(tracker_ptr);
                        unknown::release(tracker_ptr);
                    }
                    false
                } else {
                    true
                };

                link = Some(TrackerLink {
                    tracker: AtomicUsize::new(tracker_ptr as usize),
                    owns_tracker,
                    disconnected: AtomicBool::new(false),
                    context_token: tracker::context_token(),
                });
            }
        }

        let aggregated_export = flags.contains(ImportFlags::AGGREGATION)
            && unsafe { abi::dispatch_from_unknown(identity) }.is_some();
        if aggregated_export {
            // The identity is one of our own exports being aggregated;
            // drop the implied reference so the pair is not self-rooted.
            // Passing the object back out restores it by convention.
            unsafe { unknown::release(identity) };
        }

        let wrapper = Arc::new(ImportedWrapper {
            identity: AtomicUsize::new(identity as usize),
            inner: AtomicUsize::new(inner as usize),
            bridge_id: bridge.id(),
            bridge: Mutex::new(Some(bridge.clone())),
            proxy_handle: AtomicU64::new(handles().alloc_weak(proxy).raw()),
            proxy_resurrect_handle: AtomicU64::new(
                handles().alloc_weak_track_resurrection(proxy).raw(),
            ),
            unique_instance: flags.contains(ImportFlags::UNIQUE_INSTANCE),
            aggregated_export,
            link,
        });
        tracing::trace!(
            identity = identity as usize,
            tracker = wrapper.tracker_object() as usize,
            "imported wrapper created"
        );
        wrapper
    }

    /// The native identity this wrapper stands for; null after release.
    pub(crate) fn identity_ptr(&self) -> *mut c_void {
        self.identity.load(Ordering::Acquire) as *mut c_void
    }

    /// Owning bridge id (survives release).
    pub(crate) fn bridge_id(&self) -> u64 {
        self.bridge_id
    }

    /// Whether this wrapper bypassed the identity cache.
    pub(crate) fn is_unique_instance(&self) -> bool {
        self.unique_instance
    }

    /// Whether the identity is one of this runtime's own exports pulled
    /// back in through aggregation.
    pub(crate) fn is_aggregated_export(&self) -> bool {
        self.aggregated_export
    }

    /// The connected tracker object; null when absent or disconnected.
    pub(crate) fn tracker_object(&self) -> *mut c_void {
        match &self.link {
            Some(link) if !link.disconnected.load(Ordering::Acquire) => {
                link.tracker.load(Ordering::Acquire) as *mut c_void
            }
            _ => std::ptr::null_mut(),
        }
    }

    /// Whether this wrapper participates in reference tracking.
    pub(crate) fn is_tracker_wrapper(&self) -> bool {
        self.link.is_some()
    }

    /// Context token recorded at creation, for tracker wrappers.
    pub(crate) fn context_token(&self) -> Option<usize> {
        self.link.as_ref().map(|link| link.context_token)
    }

    /// The proxy weak handle consulted by the tracker runtime.
    pub(crate) fn proxy_handle(&self) -> Option<Handle> {
        Handle::from_raw(self.proxy_handle.load(Ordering::Acquire))
    }

    /// Resolve the managed proxy, if it is still alive.
    pub(crate) fn resolve_proxy(&self) -> Option<Obj> {
        self.proxy_handle().and_then(|h| handles().resolve(h))
    }

    /// One-shot tracker disconnect. Always releases the implied
    /// base-interface ownership; additionally releases the tracker
    /// interface and clears the pointer when this wrapper owns it. Must
    /// run before the rest of release so the connection cannot leak.
    pub(crate) fn disconnect_tracker(&self) {
        let Some(link) = &self.link else {
            return;
        };
        let tracker = link.tracker.load(Ordering::Acquire) as *mut c_void;
        if tracker.is_null()
            || link
                .disconnected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        unsafe {
            // The runtime's implied base-interface ownership.
            tracker::release_from_source(tracker);
            if link.owns_tracker {
                tracker::release_from_source(tracker);
                unknown::release(tracker);
                link.tracker.store(0, Ordering::Release);
            }
        }
    }

    /// Tear the wrapper down. Safe to reach from both the explicit path
    /// and proxy finalization; every sub-step checks cleared state first.
    pub(crate) fn release(&self) {
        if self.link.is_some() {
            tracker_registry().wrappers.remove(self);
            self.disconnect_tracker();
        }

        if !self.unique_instance {
            if let Some(bridge) = self.bridge.lock().take() {
                bridge
                    .imports()
                    .remove(self.identity.load(Ordering::Acquire), self);
            }
        }

        if let Some(handle) = Handle::from_raw(self.proxy_handle.swap(0, Ordering::AcqRel)) {
            handles().free(handle);
        }
        if let Some(handle) = Handle::from_raw(self.proxy_resurrect_handle.swap(0, Ordering::AcqRel))
        {
            handles().free(handle);
        }

        let inner = self.inner.swap(0, Ordering::AcqRel) as *mut c_void;
        if !inner.is_null() {
            unsafe { unknown::release(inner) };
        }

        self.identity.store(0, Ordering::Release);
    }
}

impl Drop for ImportedWrapper {
    fn drop(&mut self) {
        // Handles and native references must have been released through
        // release(); dropping a wrapper that still owns them is a
        // teardown-ordering bug.
        debug_assert_eq!(self.inner.load(Ordering::Acquire), 0, "inner leaked");
    }
}
