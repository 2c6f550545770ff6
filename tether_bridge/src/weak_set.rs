//! Concurrent weak set used to track tracker-aware imported wrappers.
//!
//! Writers (add/remove) serialize on a mutex; readers never take it.
//! Enumeration snapshots the bucket-array pointer once and then follows
//! atomic chain links, so a collection-pause walk can run while a writer
//! is mid-mutation and still observe a consistent structure:
//!
//! - adds append at chain tails; an in-flight enumeration sees the new
//!   node or it doesn't, never a torn bucket
//! - removes unlink a node without touching its own `next`, so an
//!   enumerator paused on the node continues into live chain
//! - expansion builds an entirely new bucket array with new nodes and
//!   publishes it with one store; enumerations holding the old array see
//!   a stable snapshot
//!
//! There is no collector to keep unlinked nodes alive for in-flight
//! enumerators, so retired nodes and replaced arrays go to a retirement
//! list drained only when the atomic enumerator count is zero. Retired
//! memory is unreachable from the published array, so a new enumerator
//! can never wander into it.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;

const DEFAULT_BUCKETS: usize = 7;

struct Node<T> {
    value: Weak<T>,
    next: AtomicPtr<Node<T>>,
}

struct BucketArray<T> {
    buckets: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> BucketArray<T> {
    fn new(len: usize) -> Box<BucketArray<T>> {
        let buckets = (0..len)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(BucketArray { buckets })
    }
}

struct WriterState<T> {
    len: usize,
    retired_nodes: Vec<*mut Node<T>>,
    retired_arrays: Vec<*mut BucketArray<T>>,
}

/// Bucketed weak set with lock-free enumeration.
pub(crate) struct WeakSet<T> {
    buckets: AtomicPtr<BucketArray<T>>,
    writer: Mutex<WriterState<T>>,
    enumerators: AtomicUsize,
}

impl<T> WeakSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: AtomicPtr::new(Box::into_raw(BucketArray::new(DEFAULT_BUCKETS))),
            writer: Mutex::new(WriterState {
                len: 0,
                retired_nodes: Vec::new(),
                retired_arrays: Vec::new(),
            }),
            enumerators: AtomicUsize::new(0),
        }
    }

    fn bucket_of(addr: usize, buckets: usize) -> usize {
        // Pointer identity is the element's hash; a Fibonacci mix spreads
        // aligned allocations across buckets.
        ((addr as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize % buckets
    }

    /// Add `value`; a no-op if an entry for the same allocation is
    /// already present.
    pub(crate) fn add(&self, value: Weak<T>) {
        let mut state = self.writer.lock();
        let array = unsafe { &*self.buckets.load(Ordering::Acquire) };
        let addr = Weak::as_ptr(&value) as *const () as usize;
        let bucket = &array.buckets[Self::bucket_of(addr, array.buckets.len())];

        let mut tail: Option<&Node<T>> = None;
        let mut cursor = bucket.load(Ordering::Acquire);
        while !cursor.is_null() {
            let node = unsafe { &*cursor };
            if Weak::ptr_eq(&node.value, &value) {
                return;
            }
            tail = Some(node);
            cursor = node.next.load(Ordering::Acquire);
        }

        let node = Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(std::ptr::null_mut()),
        }));
        match tail {
            Some(prev) => prev.next.store(node, Ordering::Release),
            None => bucket.store(node, Ordering::Release),
        }

        state.len += 1;
        if state.len > array.buckets.len() * 2 {
            self.expand(&mut state);
        }
        self.drain_retired(&mut state);
    }

    /// Remove the entry for the allocation behind `value`, if present.
    pub(crate) fn remove(&self, value: &T) {
        let addr = value as *const T as *const () as usize;
        let mut state = self.writer.lock();
        let array = unsafe { &*self.buckets.load(Ordering::Acquire) };
        let bucket = &array.buckets[Self::bucket_of(addr, array.buckets.len())];

        let mut prev: Option<&Node<T>> = None;
        let mut cursor = bucket.load(Ordering::Acquire);
        while !cursor.is_null() {
            let node = unsafe { &*cursor };
            if Weak::as_ptr(&node.value) as *const () as usize == addr {
                let next = node.next.load(Ordering::Acquire);
                match prev {
                    Some(p) => p.next.store(next, Ordering::Release),
                    None => bucket.store(next, Ordering::Release),
                }
                state.len -= 1;
                state.retired_nodes.push(cursor);
                break;
            }
            prev = Some(node);
            cursor = node.next.load(Ordering::Acquire);
        }
        self.drain_retired(&mut state);
    }

    /// Rebuild into a larger array. Every entry gets a fresh node so an
    /// enumeration of the old array never observes a mutated link.
    fn expand(&self, state: &mut WriterState<T>) {
        let old_ptr = self.buckets.load(Ordering::Acquire);
        let old = unsafe { &*old_ptr };
        let new = BucketArray::new(old.buckets.len() * 2 + 1);
        for bucket in old.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while !cursor.is_null() {
                let node = unsafe { &*cursor };
                let addr = Weak::as_ptr(&node.value) as *const () as usize;
                let target = Self::bucket_of(addr, new.buckets.len());
                let head = new.buckets[target].load(Ordering::Relaxed);
                let fresh = Box::into_raw(Box::new(Node {
                    value: node.value.clone(),
                    next: AtomicPtr::new(head),
                }));
                new.buckets[target].store(fresh, Ordering::Relaxed);
                cursor = node.next.load(Ordering::Acquire);
            }
        }

        self.buckets.store(Box::into_raw(new), Ordering::Release);
        state.retired_arrays.push(old_ptr);
        for bucket in old.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while !cursor.is_null() {
                state.retired_nodes.push(cursor);
                cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
            }
        }
    }

    /// Free retired memory once no enumerator can still reference it.
    fn drain_retired(&self, state: &mut WriterState<T>) {
        if state.retired_nodes.is_empty() && state.retired_arrays.is_empty() {
            return;
        }
        if self.enumerators.load(Ordering::Acquire) != 0 {
            return;
        }
        for node in state.retired_nodes.drain(..) {
            drop(unsafe { Box::from_raw(node) });
        }
        for array in state.retired_arrays.drain(..) {
            drop(unsafe { Box::from_raw(array) });
        }
    }

    /// Current element count (writer-accurate; diagnostics and tests).
    pub(crate) fn len(&self) -> usize {
        self.writer.lock().len
    }

    /// Hold the modification lock across a closure; enumerations inside
    /// observe a quiescent set.
    pub(crate) fn with_modification_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.writer.lock();
        f()
    }

    /// Snapshot enumerator. Guaranteed to visit every element present for
    /// the whole enumeration; concurrent adds and removes may or may not
    /// be observed.
    pub(crate) fn iter(&self) -> SetIter<'_, T> {
        self.enumerators.fetch_add(1, Ordering::AcqRel);
        SetIter {
            set: self,
            array: self.buckets.load(Ordering::Acquire),
            bucket: 0,
            node: std::ptr::null_mut(),
            started: false,
        }
    }
}

impl<T> Drop for WeakSet<T> {
    fn drop(&mut self) {
        let mut state = self.writer.lock();
        let array = unsafe { Box::from_raw(self.buckets.load(Ordering::Acquire)) };
        for bucket in array.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while !cursor.is_null() {
                let node = unsafe { Box::from_raw(cursor) };
                cursor = node.next.load(Ordering::Acquire);
            }
        }
        for node in state.retired_nodes.drain(..) {
            drop(unsafe { Box::from_raw(node) });
        }
        for retired in state.retired_arrays.drain(..) {
            drop(unsafe { Box::from_raw(retired) });
        }
    }
}

/// Enumerator over one bucket-array snapshot.
pub(crate) struct SetIter<'a, T> {
    set: &'a WeakSet<T>,
    array: *const BucketArray<T>,
    bucket: usize,
    node: *mut Node<T>,
    started: bool,
}

impl<T> Iterator for SetIter<'_, T> {
    type Item = Weak<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let array = unsafe { &*self.array };
        if !self.started {
            self.started = true;
            self.node = array.buckets[0].load(Ordering::Acquire);
        } else if !self.node.is_null() {
            self.node = unsafe { (*self.node).next.load(Ordering::Acquire) };
        }
        while self.node.is_null() {
            self.bucket += 1;
            if self.bucket >= array.buckets.len() {
                return None;
            }
            self.node = array.buckets[self.bucket].load(Ordering::Acquire);
        }
        Some(unsafe { (*self.node).value.clone() })
    }
}

impl<T> Drop for SetIter<'_, T> {
    fn drop(&mut self) {
        self.set.enumerators.fetch_sub(1, Ordering::AcqRel);
    }
}

// Safety: nodes hand out only cloned `Weak`s; shared state is atomic or
// lock-protected, and retired pointers are touched only under the writer
// lock.
unsafe impl<T: Send + Sync> Send for WeakSet<T> {}
unsafe impl<T: Send + Sync> Sync for WeakSet<T> {}
