//! Split lock-free reference count.
//!
//! One 64-bit word carries two independent counters and a destruction
//! sentinel:
//!
//! ```text
//! 63                32 31 30                 0
//! +------------------+--+-------------------+
//! |  tracker count   |S |   normal count    |
//! +------------------+--+-------------------+
//! ```
//!
//! The sentinel bit never clears once set. The word equal to exactly the
//! sentinel — both counters zero, sentinel set — is the unique "safe to
//! free" state. All transitions are compare-and-swap retry loops; no
//! operation blocks.
//!
//! No raw bit manipulation escapes this module.

use std::sync::atomic::{AtomicU64, Ordering};

const TRACKER_REF_SHIFT: u32 = 32;
const TRACKER_REF_UNIT: u64 = 1 << TRACKER_REF_SHIFT;
const DESTROY_SENTINEL: u64 = 0x0000_0000_8000_0000;
const TRACKER_COUNT_MASK: u64 = 0xffff_ffff_0000_0000;
const NORMAL_COUNT_MASK: u64 = 0x0000_0000_7fff_ffff;

#[inline]
fn normal_count(word: u64) -> u32 {
    (word & NORMAL_COUNT_MASK) as u32
}

#[inline]
fn tracker_count(word: u64) -> u32 {
    ((word & TRACKER_COUNT_MASK) >> TRACKER_REF_SHIFT) as u32
}

#[inline]
fn marked_to_destroy(word: u64) -> bool {
    word & DESTROY_SENTINEL != 0
}

/// The packed two-family reference count of an exported wrapper.
///
/// `repr(transparent)` so the word can live inside a `repr(C)` wrapper
/// header.
#[repr(transparent)]
pub struct SplitRefCount(AtomicU64);

impl SplitRefCount {
    /// A fresh count: both families zero, sentinel clear.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current normal (native caller) count.
    #[inline]
    pub fn normal(&self) -> u32 {
        normal_count(self.0.load(Ordering::Acquire))
    }

    /// Current tracker count.
    #[inline]
    pub fn tracker(&self) -> u32 {
        tracker_count(self.0.load(Ordering::Acquire))
    }

    /// The raw composite word. Tests use this to assert the two families
    /// never perturb each other.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether destruction has been requested.
    #[inline]
    pub fn is_marked_to_destroy(&self) -> bool {
        marked_to_destroy(self.0.load(Ordering::Acquire))
    }

    /// Add one normal reference; returns the new normal count.
    pub fn add_ref(&self) -> u32 {
        let word = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        normal_count(word)
    }

    /// Drop one normal reference; returns the new normal count.
    ///
    /// Calling with a zero normal count is a caller contract violation.
    pub fn release(&self) -> u32 {
        debug_assert!(self.normal() != 0, "release with no outstanding references");
        let word = self.0.fetch_sub(1, Ordering::AcqRel) - 1;
        normal_count(word)
    }

    /// Add one tracker reference; returns the new tracker count. The
    /// normal-count bits are untouched.
    pub fn add_ref_from_tracker(&self) -> u32 {
        let mut prev = self.0.load(Ordering::Relaxed);
        loop {
            match self.0.compare_exchange_weak(
                prev,
                prev + TRACKER_REF_UNIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return tracker_count(prev + TRACKER_REF_UNIT),
                Err(observed) => prev = observed,
            }
        }
    }

    /// Drop one tracker reference; returns the new tracker count and
    /// whether this release observed the bare sentinel — the state in
    /// which the caller must run destruction now, because no later
    /// release will.
    pub fn release_from_tracker(&self) -> (u32, bool) {
        debug_assert!(self.tracker() != 0, "tracker release with no tracker references");
        let mut prev = self.0.load(Ordering::Relaxed);
        loop {
            let next = prev - TRACKER_REF_UNIT;
            match self
                .0
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return (tracker_count(next), next == DESTROY_SENTINEL),
                Err(observed) => prev = observed,
            }
        }
    }

    /// Set the destroy sentinel without touching either counter. Returns
    /// `true` exactly when the resulting word is the bare sentinel,
    /// meaning the caller owns the one free.
    pub fn mark_destroy(&self) -> bool {
        let mut prev = self.0.load(Ordering::Relaxed);
        loop {
            let next = prev | DESTROY_SENTINEL;
            match self
                .0
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next == DESTROY_SENTINEL,
                Err(observed) => prev = observed,
            }
        }
    }

    /// The rootedness predicate consulted during collection: rooted when
    /// natively referenced, or tracker-referenced while pegged (locally
    /// or globally).
    pub fn is_rooted(&self, pegged: bool, global_pegging: bool) -> bool {
        let word = self.0.load(Ordering::Acquire);
        normal_count(word) > 0 || (tracker_count(word) > 0 && (pegged || global_pegging))
    }
}

impl Default for SplitRefCount {
    fn default() -> Self {
        Self::new()
    }
}
