//! Collection driver.
//!
//! One collection cycle has three phases:
//!
//! 1. **Pause**: registered [`CollectionHooks`] run their graph-walk and
//!    detach work. By convention mutators are quiescent here; hooks must
//!    not allocate managed objects or take caller-visible locks.
//! 2. **Handle refresh**: every ref-counted handle's rootedness predicate
//!    is re-evaluated under the table lock.
//! 3. **Finalization**: the finalizer queue drains outside the pause.
//!
//! The driver also carries cross-heap reference edges recorded during
//! walks and a memory-pressure ledger embedders can use to decide when to
//! call [`Runtime::collect`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::finalize::finalizers;
use crate::handles::{handles, Handle};
use crate::object::{ManagedObject, Obj};

/// Pause-time callbacks a cooperating subsystem registers once.
///
/// All three run while mutators are quiescent; implementations must not
/// allocate managed objects and must not block.
pub trait CollectionHooks: Send + Sync {
    /// Reference tracking is starting; walk external graphs now.
    fn tracking_started(&self) {}

    /// Liveness is decided; notify collaborators about objects that did
    /// not survive this cycle.
    fn detach_unpromoted(&self) {}

    /// Reference tracking for this cycle is over.
    fn tracking_completed(&self) {}
}

/// One recorded cross-heap edge: while `source` is reachable, `target`
/// must be treated as reachable too.
struct CrossReference {
    source: Weak<dyn ManagedObject>,
    target: Obj,
}

/// The collection driver.
pub struct Runtime {
    hooks: RwLock<Vec<Arc<dyn CollectionHooks>>>,
    /// Edges recorded by the current walk. The buffer retains capacity
    /// across cycles so steady-state walks do not allocate.
    cross_refs: Mutex<Vec<CrossReference>>,
    pressure: AtomicI64,
    collections: AtomicU64,
}

impl Runtime {
    fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            cross_refs: Mutex::new(Vec::with_capacity(64)),
            pressure: AtomicI64::new(0),
            collections: AtomicU64::new(0),
        }
    }

    /// Register pause hooks. Registration is append-only; hooks live for
    /// the process.
    pub fn register_hooks(&self, hooks: Arc<dyn CollectionHooks>) {
        self.hooks.write().push(hooks);
    }

    /// Run one full collection cycle.
    pub fn collect(&self) {
        self.collections.fetch_add(1, Ordering::AcqRel);

        {
            // Pause phase. Walks repopulate the cross-reference buffer.
            // Hooks are snapshotted so a late registration from inside a
            // predicate or callback cannot re-enter the hooks lock.
            self.cross_refs.lock().clear();
            let hooks: Vec<Arc<dyn CollectionHooks>> = self.hooks.read().clone();
            for h in hooks.iter() {
                h.tracking_started();
            }

            // An edge with a dead source is discarded; the rest hold
            // their targets strongly until the next cycle's walk clears
            // the buffer, which is what makes the target reachable for
            // the rest of this cycle.
            self.cross_refs
                .lock()
                .retain(|edge| edge.source.strong_count() > 0);

            handles().refresh_anchors();

            for h in hooks.iter() {
                h.detach_unpromoted();
            }
            for h in hooks.iter() {
                h.tracking_completed();
            }
        }

        // Finalization happens outside the pause.
        finalizers().run_pending();
    }

    /// The "suspend" trigger: a blocking collection of the older
    /// generations. The in-process driver has one generation, so this is
    /// a full cycle.
    pub fn collect_background(&self) {
        self.collect();
    }

    /// Whether the object behind `handle` survived into the current
    /// cycle. Meaningful only inside pause hooks.
    pub fn is_promoted(&self, handle: Handle) -> bool {
        handles().resolve(handle).is_some()
    }

    /// Record a cross-heap edge during a walk. Only valid inside
    /// [`CollectionHooks::tracking_started`].
    pub fn record_cross_reference(&self, source: &Obj, target: Obj) {
        self.cross_refs.lock().push(CrossReference {
            source: Arc::downgrade(source),
            target,
        });
    }

    /// Account native allocation attributable to managed objects.
    pub fn add_memory_pressure(&self, bytes: u64) {
        self.pressure.fetch_add(bytes as i64, Ordering::AcqRel);
    }

    /// Remove previously added pressure.
    pub fn remove_memory_pressure(&self, bytes: u64) {
        self.pressure.fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    /// Current pressure ledger value.
    pub fn memory_pressure(&self) -> i64 {
        self.pressure.load(Ordering::Acquire)
    }

    /// Number of cycles run so far.
    pub fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Acquire)
    }
}

/// The global collection driver.
pub fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(Runtime::new)
}
