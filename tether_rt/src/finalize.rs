//! Re-armable finalizers.
//!
//! A finalizer watches a death predicate and runs once the predicate
//! reports the watched object is gone. The callback decides whether the
//! entry is finished ([`Finalize::Done`]) or must run again on a later
//! cycle ([`Finalize::Rearm`]) — the primitive behind resurrection-safe
//! teardown ordering: a callback that discovers outstanding references
//! re-arms instead of freeing.
//!
//! Callbacks run outside the queue lock, so they may allocate, resolve
//! handles, or register further finalizers.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::object::Obj;

/// Outcome of one finalizer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// The entry is finished and is removed from the queue.
    Done,
    /// Run again on the next cycle.
    Rearm,
}

type DeathPredicate = Box<dyn Fn() -> bool + Send + Sync>;
type Callback = Box<dyn FnMut() -> Finalize + Send>;

struct Entry {
    is_dead: DeathPredicate,
    run: Callback,
}

/// Queue of pending finalizers, drained at the end of each collection.
pub struct FinalizerQueue {
    entries: Mutex<Vec<Entry>>,
}

impl FinalizerQueue {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a finalizer with an explicit death predicate.
    pub fn register(
        &self,
        is_dead: impl Fn() -> bool + Send + Sync + 'static,
        run: impl FnMut() -> Finalize + Send + 'static,
    ) {
        self.entries.lock().push(Entry {
            is_dead: Box::new(is_dead),
            run: Box::new(run),
        });
    }

    /// Register a finalizer that fires once `watched` has no strong
    /// references left.
    pub fn register_for(&self, watched: &Obj, run: impl FnMut() -> Finalize + Send + 'static) {
        let weak = Arc::downgrade(watched);
        self.register(move || weak.strong_count() == 0, run);
    }

    /// Run every finalizer whose watched object has died. Returns how
    /// many callbacks ran. Re-armed and still-alive entries stay queued.
    pub fn run_pending(&self) -> usize {
        // Take the whole queue so callbacks can register new entries
        // without re-entering the lock.
        let taken = std::mem::take(&mut *self.entries.lock());
        let mut ran = 0;
        let mut kept = Vec::with_capacity(taken.len());
        for mut entry in taken {
            if !(entry.is_dead)() {
                kept.push(entry);
                continue;
            }
            ran += 1;
            if (entry.run)() == Finalize::Rearm {
                kept.push(entry);
            }
        }
        self.entries.lock().append(&mut kept);
        ran
    }

    /// Number of queued entries (diagnostics and tests).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The global finalizer queue.
pub fn finalizers() -> &'static FinalizerQueue {
    static QUEUE: OnceLock<FinalizerQueue> = OnceLock::new();
    QUEUE.get_or_init(FinalizerQueue::new)
}
