//! Identity cache: native identity pointer → imported wrapper.
//!
//! One lock guards all mutations. Entries are weak on both levels: the
//! wrapper reference may be dead (wrapper finalized) and a live wrapper's
//! proxy may be dead (proxy collected, finalizer not yet run); both count
//! as stale. Staleness is tolerated and repaired lazily — a reader that
//! trips over a dead entry evicts or overwrites it.
//!
//! The race rule is load-bearing: when two threads build wrappers for
//! the same new identity, whichever reaches the lock with a live entry
//! already present loses and must release its redundant wrapper; a live
//! cached proxy always wins over a racing new one.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_rt::Obj;

use crate::imported::ImportedWrapper;

/// Lock-protected identity → wrapper map.
pub(crate) struct IdentityCache {
    entries: Mutex<FxHashMap<usize, Weak<ImportedWrapper>>>,
}

impl IdentityCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Install `(wrapper, proxy)` for `identity` unless a live pair is
    /// already cached, in which case the cached pair wins and the caller
    /// must release its redundant wrapper.
    pub(crate) fn get_or_add(
        &self,
        identity: usize,
        wrapper: &Arc<ImportedWrapper>,
        proxy: &Obj,
    ) -> (Arc<ImportedWrapper>, Obj) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&identity) {
            if let Some(cached) = existing.upgrade() {
                if let Some(cached_proxy) = cached.resolve_proxy() {
                    // Live entry wins over the racing newcomer.
                    return (cached, cached_proxy);
                }
            }
        }
        // No entry, or a stale one: the newest writer owns the slot.
        entries.insert(identity, Arc::downgrade(wrapper));
        (wrapper.clone(), proxy.clone())
    }

    /// Look up a live proxy for `identity`, evicting a stale entry when
    /// one is found instead.
    pub(crate) fn find(&self, identity: usize) -> Option<Obj> {
        let mut entries = self.entries.lock();
        match entries.get(&identity) {
            Some(existing) => {
                if let Some(proxy) = existing.upgrade().and_then(|w| w.resolve_proxy()) {
                    Some(proxy)
                } else {
                    entries.remove(&identity);
                    None
                }
            }
            None => None,
        }
    }

    /// Remove the entry for `identity`, but only when it still belongs
    /// to `wrapper` or is already dead — a newer entry installed after
    /// this wrapper's logical death must survive.
    pub(crate) fn remove(&self, identity: usize, wrapper: &ImportedWrapper) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&identity) {
            let owned_by_caller = match existing.upgrade() {
                Some(cached) => std::ptr::eq(Arc::as_ptr(&cached), wrapper),
                None => true,
            };
            if owned_by_caller {
                entries.remove(&identity);
            }
        }
    }

    /// Number of entries, live or stale (tests).
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
