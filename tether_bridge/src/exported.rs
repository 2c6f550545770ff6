//! Exported wrappers: native-facing wrappers around managed objects.
//!
//! An [`ExportedWrapper`] is a raw, `repr(C)` header living in one
//! aligned allocation together with its dispatch sections (see
//! [`crate::dispatch`]). Native callers hold pointers into the sections
//! and drive the split refcount through the ABI; the managed side anchors
//! the allocation through an [`ExportedHolder`], whose finalizer performs
//! the one free once both reference families have drained and the holder
//! is unreachable.
//!
//! # Teardown ordering
//!
//! 1. `destroy` sets the sentinel; the holder handle is freed exactly
//!    once, by whichever path observes the bare-sentinel word.
//! 2. The holder's finalizer re-arms while the holder is still
//!    resolvable or references remain, and frees the block only when
//!    `destroy` hands it the single `true`.

use std::alloc;
use std::any::Any;
use std::ffi::c_void;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tether_core::status::{self, RawStatus};
use tether_core::{CustomQueryOutcome, InterfaceEntry, InterfaceId};
use tether_rt::{finalizers, handles, object_identity, Finalize, Handle, ManagedObject, Obj};

use crate::abi;
use crate::dispatch;
use crate::refcount::SplitRefCount;
use crate::tracker;

bitflags! {
    /// Caller-visible export configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExportFlags: u32 {
        /// The first user-defined entry carries the caller's own base
        /// vtable; the runtime does not install one.
        const CALLER_DEFINED_UNKNOWN = 1;
        /// Install the tracker-target table so a reference-tracking host
        /// can hold and peg this wrapper.
        const TRACKER_SUPPORT = 2;
    }
}

bitflags! {
    /// Internal flag word: the caller-visible bits plus bookkeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct WrapperFlags: u32 {
        const CALLER_DEFINED_UNKNOWN = 1;
        const TRACKER_SUPPORT = 2;
        /// The wrapped object has no custom-query extension; cached after
        /// the first negative probe.
        const LACKS_CUSTOM_QUERY = 1 << 29;
        /// Tracker host requested conservative rooting of this wrapper.
        const PEGGED = 1 << 31;
    }
}

impl From<ExportFlags> for WrapperFlags {
    fn from(flags: ExportFlags) -> Self {
        WrapperFlags::from_bits_truncate(flags.bits())
    }
}

/// Native-facing wrapper header. Lives at the start of the dispatch
/// block; all access after construction goes through shared references
/// derived from raw pointers.
#[repr(C)]
pub struct ExportedWrapper {
    /// Ref-counted handle to the [`ExportedHolder`], zero once cleared.
    holder_handle: AtomicU64,
    refcount: SplitRefCount,
    flags: AtomicU32,
    user_defined_count: u32,
    user_defined: *const InterfaceEntry,
    sections: *mut u8,
}

impl ExportedWrapper {
    /// Allocate the wrapper block and install its dispatch sections.
    ///
    /// `user_defined` occupies the first slots; runtime tables follow in
    /// the fixed order the query path expects.
    pub(crate) fn allocate(
        user_defined: &'static [InterfaceEntry],
        flags: ExportFlags,
    ) -> *mut ExportedWrapper {
        let mut runtime_tables: SmallVec<[*const c_void; 3]> = SmallVec::new();
        if !flags.contains(ExportFlags::CALLER_DEFINED_UNKNOWN) {
            runtime_tables.push(abi::unknown_vtbl_ptr());
        }
        if flags.contains(ExportFlags::TRACKER_SUPPORT) {
            runtime_tables.push(abi::tracker_target_vtbl_ptr());
        }
        runtime_tables.push(abi::tagged_vtbl_ptr());

        let mut vtables: SmallVec<[*const c_void; 8]> =
            SmallVec::with_capacity(user_defined.len() + runtime_tables.len());
        vtables.extend(user_defined.iter().map(|entry| entry.vtable));
        vtables.extend(runtime_tables.iter().copied());

        let (layout, sections_offset) = dispatch::block_layout(vtables.len());
        let wrapper = unsafe {
            let block = alloc::alloc(layout);
            if block.is_null() {
                alloc::handle_alloc_error(layout);
            }
            let wrapper = block as *mut ExportedWrapper;
            let sections = block.add(sections_offset);
            dispatch::install_sections(sections, wrapper, &vtables);
            wrapper.write(ExportedWrapper {
                holder_handle: AtomicU64::new(0),
                refcount: SplitRefCount::new(),
                flags: AtomicU32::new(WrapperFlags::from(flags).bits()),
                user_defined_count: user_defined.len() as u32,
                user_defined: user_defined.as_ptr(),
                sections,
            });
            wrapper
        };
        tracing::trace!(wrapper = wrapper as usize, ?flags, "exported wrapper allocated");
        wrapper
    }

    /// Release the wrapper block. The caller must hold the single `true`
    /// returned by [`ExportedWrapper::destroy`].
    ///
    /// # Safety
    ///
    /// `wrapper` must be a block from [`ExportedWrapper::allocate`] that
    /// no other thread can still reach.
    pub(crate) unsafe fn free_block(wrapper: *mut ExportedWrapper) {
        let total = {
            let w = &*wrapper;
            w.user_defined_count as usize + runtime_table_count(w.flags())
        };
        let (layout, _) = dispatch::block_layout(total);
        alloc::dealloc(wrapper as *mut u8, layout);
    }

    #[inline]
    fn flags(&self) -> WrapperFlags {
        WrapperFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: WrapperFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: WrapperFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Add one normal reference.
    pub(crate) fn add_ref(&self) -> u32 {
        self.refcount.add_ref()
    }

    /// Drop one normal reference.
    pub(crate) fn release(&self) -> u32 {
        self.refcount.release()
    }

    /// Add one tracker reference.
    pub(crate) fn add_ref_from_tracker(&self) -> u32 {
        self.refcount.add_ref_from_tracker()
    }

    /// Drop one tracker reference. When this release observes the bare
    /// sentinel it runs destruction itself; no later release will.
    pub(crate) fn release_from_tracker(&self) -> u32 {
        let (count, destroy_now) = self.refcount.release_from_tracker();
        if destroy_now {
            self.destroy();
        }
        count
    }

    /// Tracker host requests conservative rooting.
    pub(crate) fn peg(&self) {
        self.set_flag(WrapperFlags::PEGGED);
    }

    /// Tracker host withdraws conservative rooting.
    pub(crate) fn unpeg(&self) {
        self.clear_flag(WrapperFlags::PEGGED);
    }

    /// Rootedness consulted by the collector: natively referenced, or
    /// tracker-referenced while pegged locally or globally.
    pub(crate) fn is_rooted(&self) -> bool {
        self.refcount.is_rooted(
            self.flags().contains(WrapperFlags::PEGGED),
            tracker::is_global_pegging(),
        )
    }

    /// Whether destruction has been requested.
    pub(crate) fn marked_to_destroy(&self) -> bool {
        self.refcount.is_marked_to_destroy()
    }

    /// Resolve the holder, if it is still alive.
    pub(crate) fn holder(&self) -> Option<Obj> {
        Handle::from_raw(self.holder_handle.load(Ordering::Acquire))
            .and_then(|handle| handles().resolve(handle))
    }

    /// The managed object this wrapper exports, while the holder lives.
    pub(crate) fn wrapped_object(&self) -> Option<Obj> {
        let holder = self.holder()?;
        let holder = holder.as_any().downcast_ref::<ExportedHolder>()?;
        Some(holder.wrapped().clone())
    }

    #[inline]
    fn dispatch_ptr(&self, index: usize) -> *mut c_void {
        unsafe { dispatch::slot_address(self.sections, index) }
    }

    fn user_entries(&self) -> &[InterfaceEntry] {
        unsafe { slice::from_raw_parts(self.user_defined, self.user_defined_count as usize) }
    }

    /// Runtime-defined lookup. The index arithmetic mirrors the install
    /// order in [`ExportedWrapper::allocate`].
    fn as_runtime_defined(&self, iid: &InterfaceId) -> Option<*mut c_void> {
        let flags = self.flags();
        let mut index = self.user_defined_count as usize;
        if !flags.contains(WrapperFlags::CALLER_DEFINED_UNKNOWN) {
            if *iid == InterfaceId::UNKNOWN {
                return Some(self.dispatch_ptr(index));
            }
            index += 1;
        }
        if flags.contains(WrapperFlags::TRACKER_SUPPORT) {
            if *iid == tracker::TRACKER_TARGET_IID {
                return Some(self.dispatch_ptr(index));
            }
            index += 1;
        }
        if *iid == abi::TAGGED_IID {
            return Some(self.dispatch_ptr(index));
        }
        None
    }

    fn as_user_defined(&self, iid: &InterfaceId) -> Option<*mut c_void> {
        self.user_entries()
            .iter()
            .position(|entry| entry.iid == *iid)
            .map(|index| self.dispatch_ptr(index))
    }

    /// Find an interface without adding a reference.
    pub(crate) fn as_interface(&self, iid: &InterfaceId) -> Option<*mut c_void> {
        self.as_runtime_defined(iid)
            .or_else(|| self.as_user_defined(iid))
    }

    /// Full query: runtime-defined tables first, then the custom-query
    /// extension (negative result cached), then the user-defined scan.
    /// Adds a normal reference on every hit except a custom `Handled`,
    /// which hands out its own reference.
    pub(crate) fn query_interface(&self, iid: &InterfaceId) -> Result<*mut c_void, RawStatus> {
        if let Some(ptr) = self.as_runtime_defined(iid) {
            self.add_ref();
            return Ok(ptr);
        }

        if !self.flags().contains(WrapperFlags::LACKS_CUSTOM_QUERY) {
            if let Some(holder) = self.holder() {
                let holder = holder
                    .as_any()
                    .downcast_ref::<ExportedHolder>()
                    .expect("holder handle resolves to a foreign object");
                match holder.wrapped().custom_query_interface() {
                    None => self.set_flag(WrapperFlags::LACKS_CUSTOM_QUERY),
                    Some(custom) => match custom.get_interface(iid) {
                        CustomQueryOutcome::Handled(ptr) => return Ok(ptr),
                        CustomQueryOutcome::NotHandled => {}
                        CustomQueryOutcome::Failed => return Err(status::INVALID_CAST),
                    },
                }
            }
        }

        match self.as_user_defined(iid) {
            Some(ptr) => {
                self.add_ref();
                Ok(ptr)
            }
            None => Err(status::INVALID_CAST),
        }
    }

    /// Query on behalf of the tracker host. Refused once teardown has
    /// begun so a collection callback cannot resurrect the wrapper.
    pub(crate) fn query_interface_for_tracker(
        &self,
        iid: &InterfaceId,
    ) -> Result<*mut c_void, RawStatus> {
        if self.marked_to_destroy() || self.holder().is_none() {
            return Err(status::TEARDOWN_DENIED);
        }
        self.query_interface(iid)
    }

    /// Request destruction. Returns `true` exactly once across all
    /// callers — to the one that must free the holder handle now; every
    /// redundant call returns `false`, except after the handle is already
    /// cleared, when the block itself is safe to free.
    pub(crate) fn destroy(&self) -> bool {
        debug_assert!(
            self.refcount.normal() == 0 || self.holder_handle.load(Ordering::Acquire) == 0,
            "destroy with live native references"
        );

        if self.holder_handle.load(Ordering::Acquire) == 0 {
            // Already destroyed, or this wrapper lost a creation race and
            // never had a holder installed.
            return true;
        }

        if self.refcount.mark_destroy() {
            if let Some(handle) = Handle::from_raw(self.holder_handle.swap(0, Ordering::AcqRel)) {
                handles().free(handle);
            }
            true
        } else {
            false
        }
    }

    /// Raw refcount word, for tests asserting family independence.
    #[cfg(test)]
    pub(crate) fn refcount_raw(&self) -> u64 {
        self.refcount.raw()
    }
}

fn runtime_table_count(flags: WrapperFlags) -> usize {
    let mut count = 1; // tagged table is always installed
    if !flags.contains(WrapperFlags::CALLER_DEFINED_UNKNOWN) {
        count += 1;
    }
    if flags.contains(WrapperFlags::TRACKER_SUPPORT) {
        count += 1;
    }
    count
}

// =============================================================================
// ExportedHolder
// =============================================================================

/// Managed companion anchoring an [`ExportedWrapper`] allocation.
///
/// Exactly one holder exists per (bridge, instance) pair. It keeps the
/// wrapped object alive, and is itself kept alive by the wrapper's
/// ref-counted handle while the wrapper is rooted.
pub struct ExportedHolder {
    wrapper: *mut ExportedWrapper,
    wrapped: Obj,
}

/// Live holders per instance identity. Lets liveness checks distinguish
/// outside references to an instance from the references its own holders
/// contribute.
fn holder_counts() -> &'static Mutex<FxHashMap<usize, usize>> {
    static COUNTS: std::sync::OnceLock<Mutex<FxHashMap<usize, usize>>> = std::sync::OnceLock::new();
    COUNTS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Number of live holders currently keeping `instance_key` alive.
pub(crate) fn internal_holds(instance_key: usize) -> usize {
    holder_counts()
        .lock()
        .get(&instance_key)
        .copied()
        .unwrap_or(0)
}

// Safety: the wrapper pointer stays valid for the holder's lifetime (the
// holder's finalizer is the only path that frees it), and all wrapper
// state is atomic.
unsafe impl Send for ExportedHolder {}
unsafe impl Sync for ExportedHolder {}

impl ManagedObject for ExportedHolder {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for ExportedHolder {
    fn drop(&mut self) {
        let mut counts = holder_counts().lock();
        if let Some(count) = counts.get_mut(&object_identity(&self.wrapped)) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&object_identity(&self.wrapped));
            }
        }
    }
}

impl ExportedHolder {
    /// Build the holder for `wrapper`, install its back-handle, and
    /// register the finalizer that will eventually free the block.
    pub(crate) fn install(wrapper: *mut ExportedWrapper, wrapped: Obj) -> Arc<ExportedHolder> {
        *holder_counts()
            .lock()
            .entry(object_identity(&wrapped))
            .or_insert(0) += 1;
        let holder = Arc::new(ExportedHolder { wrapper, wrapped });
        let as_obj: Obj = holder.clone();

        // The rootedness predicate runs under the handle-table lock; the
        // free in destroy() takes the same lock, so the predicate never
        // sees freed wrapper state.
        let wrapper_addr = wrapper as usize;
        let handle = handles().alloc_ref_counted(
            &as_obj,
            Box::new(move || unsafe { (*(wrapper_addr as *mut ExportedWrapper)).is_rooted() }),
        );
        unsafe {
            (*wrapper).holder_handle.store(handle.raw(), Ordering::Release);
        }

        let weak = Arc::downgrade(&holder);
        finalizers().register(
            move || weak.strong_count() == 0,
            move || releaser_step(wrapper_addr as *mut ExportedWrapper),
        );

        holder
    }

    /// The managed object this holder keeps alive.
    pub fn wrapped(&self) -> &Obj {
        &self.wrapped
    }

    /// Bump the wrapper's normal count (the per-export reference).
    pub(crate) fn add_ref(&self) -> u32 {
        unsafe { (*self.wrapper).add_ref() }
    }

    /// The base interface pointer handed to native callers, without
    /// adding a reference.
    pub(crate) fn unknown_ptr(&self) -> Option<*mut c_void> {
        unsafe { (*self.wrapper).as_interface(&InterfaceId::UNKNOWN) }
    }
}

/// One finalization attempt for a holder's wrapper.
fn releaser_step(wrapper: *mut ExportedWrapper) -> Finalize {
    let w = unsafe { &*wrapper };

    if let Some(handle) = Handle::from_raw(w.holder_handle.load(Ordering::Acquire)) {
        if handles().resolve(handle).is_some() {
            // The holder is still reachable through its handle; wait for
            // a later cycle.
            return Finalize::Rearm;
        }
    }

    if w.destroy() {
        tracing::trace!(wrapper = wrapper as usize, "exported wrapper freed");
        unsafe { ExportedWrapper::free_block(wrapper) };
        Finalize::Done
    } else {
        // Outstanding tracker references; destruction completes on the
        // release that drains them.
        Finalize::Rearm
    }
}

/// Discard a wrapper that lost a creation race before a holder was
/// installed.
pub(crate) fn discard_unregistered(wrapper: *mut ExportedWrapper) {
    let destroyed = unsafe { (*wrapper).destroy() };
    debug_assert!(destroyed, "race-loser wrapper had a holder installed");
    unsafe { ExportedWrapper::free_block(wrapper) };
}
