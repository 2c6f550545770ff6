//! Process-wide handle table.
//!
//! Handles are opaque non-zero tokens the bridge stores inside raw wrapper
//! memory, where a `Weak` or `Arc` cannot live. Three kinds exist:
//!
//! - **weak**: resolves while the target has strong references
//! - **resurrection-tracking weak**: identical resolution; kept as a
//!   distinct kind because teardown protocols consult it specifically
//! - **ref-counted**: additionally anchors its target strongly while a
//!   caller-supplied rootedness predicate reports `true`; predicates are
//!   re-evaluated once per collection under the table lock
//!
//! The table lock also makes predicate evaluation and `free` mutually
//! exclusive, so a predicate never runs against freed wrapper state.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::object::{ManagedObject, Obj};

/// Opaque handle token. Never zero, never reused within a process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Raw token value, for storage in atomic wrapper fields.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a handle from a raw token. Zero means "no handle".
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Handle> {
        NonZeroU64::new(raw).map(Handle)
    }
}

/// Rootedness predicate attached to a ref-counted handle.
pub type RootedPredicate = Box<dyn Fn() -> bool + Send + Sync>;

enum Slot {
    Weak(Weak<dyn ManagedObject>),
    WeakTrackResurrection(Weak<dyn ManagedObject>),
    RefCounted {
        target: Weak<dyn ManagedObject>,
        anchor: Option<Obj>,
        is_rooted: RootedPredicate,
    },
}

impl Slot {
    fn resolve(&self) -> Option<Obj> {
        match self {
            Slot::Weak(w) | Slot::WeakTrackResurrection(w) => w.upgrade(),
            Slot::RefCounted { target, .. } => target.upgrade(),
        }
    }
}

/// The process-wide handle table.
pub struct HandleTable {
    slots: Mutex<FxHashMap<u64, Slot>>,
    next: AtomicU64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
            next: AtomicU64::new(1),
        }
    }

    fn insert(&self, slot: Slot) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(raw, slot);
        Handle(NonZeroU64::new(raw).expect("handle counter wrapped"))
    }

    /// Allocate a weak handle to `target`.
    pub fn alloc_weak(&self, target: &Obj) -> Handle {
        self.insert(Slot::Weak(std::sync::Arc::downgrade(target)))
    }

    /// Allocate a weak handle that teardown protocols use to ask whether
    /// the target is still finalizable-reachable.
    pub fn alloc_weak_track_resurrection(&self, target: &Obj) -> Handle {
        self.insert(Slot::WeakTrackResurrection(std::sync::Arc::downgrade(target)))
    }

    /// Allocate a ref-counted handle: `target` stays strongly anchored
    /// while `is_rooted` reports `true` at each collection. The anchor is
    /// held from allocation until the first collection that observes the
    /// predicate `false`.
    pub fn alloc_ref_counted(&self, target: &Obj, is_rooted: RootedPredicate) -> Handle {
        self.insert(Slot::RefCounted {
            target: std::sync::Arc::downgrade(target),
            anchor: Some(target.clone()),
            is_rooted,
        })
    }

    /// Resolve a handle to its target, if the target is still alive.
    pub fn resolve(&self, handle: Handle) -> Option<Obj> {
        self.slots.lock().get(&handle.raw()).and_then(Slot::resolve)
    }

    /// Free a handle. Freeing an already-freed handle is a no-op.
    pub fn free(&self, handle: Handle) {
        self.slots.lock().remove(&handle.raw());
    }

    /// Whether the handle is still allocated.
    pub fn is_allocated(&self, handle: Handle) -> bool {
        self.slots.lock().contains_key(&handle.raw())
    }

    /// Re-evaluate every ref-counted handle's rootedness predicate,
    /// anchoring or releasing its target accordingly. Called once per
    /// collection while mutators are quiescent.
    pub(crate) fn refresh_anchors(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            if let Slot::RefCounted {
                target,
                anchor,
                is_rooted,
            } = slot
            {
                *anchor = if is_rooted() { target.upgrade() } else { None };
            }
        }
    }

    /// Number of live slots (diagnostics and tests).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The global handle table.
pub fn handles() -> &'static HandleTable {
    static TABLE: OnceLock<HandleTable> = OnceLock::new();
    TABLE.get_or_init(HandleTable::new)
}
