//! Runtime statistics for lock usage.
//!
//! A profile block is owned by one thread and attached to a mutex handle
//! with `handle_with_profile`; the handle updates it as critical sections
//! are entered and left. Nothing in the hot path is shared, so the counters
//! are plain integers; aggregation across threads happens after they have
//! joined, by [`accumulate`](Profile::accumulate)-ing the per-thread blocks
//! into one.
//!
//! Each profile type is padded to a cache line so that two threads'
//! profile blocks never share one.

use crate::{htm::Status, util::CachePadded};

/// Operations common to all profile block flavors.
pub trait Profile {
    /// Records a release of the (fallback) lock.
    fn note_unlock(&mut self);

    /// Records the commit of an outermost elided critical section.
    fn note_commit(&mut self) {}

    /// Records a transaction abort with the given status.
    fn note_abort(&mut self, status: Status) {
        let _ = status;
    }

    /// Folds another thread's counters into this block.
    fn accumulate(&mut self, other: &Self);

    /// Returns `true` if the counters are internally consistent for a run
    /// of `total_ops` lock/unlock pairs.
    #[must_use]
    fn consistent(&self, total_ops: u64) -> bool;
}

/// The (empty) profile block of the null mutex flavors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NullProfile(());

// === impl NullProfile ===

impl NullProfile {
    /// Returns a new, empty profile block.
    #[must_use]
    pub const fn new() -> Self {
        Self(())
    }
}

impl Profile for NullProfile {
    fn note_unlock(&mut self) {}

    fn accumulate(&mut self, _: &Self) {}

    fn consistent(&self, _: u64) -> bool {
        true
    }
}

/// The profile block of the plain spinning mutex flavors.
#[derive(Clone, Copy, Debug, Default)]
pub struct LockProfile {
    locks_acquired: CachePadded<u64>,
}

// === impl LockProfile ===

impl LockProfile {
    /// Returns a new, zeroed profile block.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locks_acquired: CachePadded::new(0),
        }
    }

    /// The number of times the lock was acquired and released.
    #[must_use]
    pub fn locks_acquired(&self) -> u64 {
        *self.locks_acquired
    }
}

impl Profile for LockProfile {
    fn note_unlock(&mut self) {
        *self.locks_acquired += 1;
    }

    fn accumulate(&mut self, other: &Self) {
        *self.locks_acquired += other.locks_acquired();
    }

    fn consistent(&self, total_ops: u64) -> bool {
        self.locks_acquired() == total_ops
    }
}

/// The profile block of the HTM-elided mutex flavors.
///
/// Counts how critical sections completed — [`locks_elided`] transactional
/// commits vs. [`locks_acquired`] fallback acquisitions — and classifies
/// every transaction abort along the way.
///
/// [`locks_elided`]: Self::locks_elided
/// [`locks_acquired`]: Self::locks_acquired
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmProfile {
    counters: CachePadded<Counters>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    locks_acquired: u64,
    locks_elided: u64,
    explicit_aborts: u64,
    conflict_aborts: u64,
    capacity_aborts: u64,
    nested_aborts: u64,
    other_aborts: u64,
}

// === impl HtmProfile ===

impl HtmProfile {
    /// Returns a new, zeroed profile block.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counters: CachePadded::new(Counters {
                locks_acquired: 0,
                locks_elided: 0,
                explicit_aborts: 0,
                conflict_aborts: 0,
                capacity_aborts: 0,
                nested_aborts: 0,
                other_aborts: 0,
            }),
        }
    }

    /// The number of critical sections that took the fallback lock.
    #[must_use]
    pub fn locks_acquired(&self) -> u64 {
        self.counters.locks_acquired
    }

    /// The number of critical sections that committed transactionally,
    /// without ever acquiring the fallback lock.
    #[must_use]
    pub fn locks_elided(&self) -> u64 {
        self.counters.locks_elided
    }

    /// Aborts from [`user_abort!`](crate::user_abort) (for the elided
    /// locks: a transaction observed the fallback lock held).
    #[must_use]
    pub fn explicit_aborts(&self) -> u64 {
        self.counters.explicit_aborts
    }

    /// Aborts caused by memory conflicts with other agents.
    #[must_use]
    pub fn conflict_aborts(&self) -> u64 {
        self.counters.conflict_aborts
    }

    /// Aborts caused by transactional footprint overflow.
    #[must_use]
    pub fn capacity_aborts(&self) -> u64 {
        self.counters.capacity_aborts
    }

    /// Aborts raised inside nested transactions.
    #[must_use]
    pub fn nested_aborts(&self) -> u64 {
        self.counters.nested_aborts
    }

    /// Aborts with any other (or no reported) cause.
    #[must_use]
    pub fn other_aborts(&self) -> u64 {
        self.counters.other_aborts
    }

    /// The total number of aborts, over all causes.
    #[must_use]
    pub fn total_aborts(&self) -> u64 {
        self.counters.explicit_aborts
            + self.counters.conflict_aborts
            + self.counters.capacity_aborts
            + self.counters.nested_aborts
            + self.counters.other_aborts
    }
}

impl Profile for HtmProfile {
    fn note_unlock(&mut self) {
        self.counters.locks_acquired += 1;
    }

    fn note_commit(&mut self) {
        self.counters.locks_elided += 1;
    }

    fn note_abort(&mut self, status: Status) {
        if status.contains(Status::CONFLICT) {
            self.counters.conflict_aborts += 1;
        } else if status.contains(Status::EXPLICIT) {
            self.counters.explicit_aborts += 1;
        } else if status.contains(Status::CAPACITY) {
            self.counters.capacity_aborts += 1;
        } else if status.contains(Status::NESTED) {
            self.counters.nested_aborts += 1;
        } else {
            self.counters.other_aborts += 1;
        }
    }

    fn accumulate(&mut self, other: &Self) {
        self.counters.locks_acquired += other.counters.locks_acquired;
        self.counters.locks_elided += other.counters.locks_elided;
        self.counters.explicit_aborts += other.counters.explicit_aborts;
        self.counters.conflict_aborts += other.counters.conflict_aborts;
        self.counters.capacity_aborts += other.counters.capacity_aborts;
        self.counters.nested_aborts += other.counters.nested_aborts;
        self.counters.other_aborts += other.counters.other_aborts;
    }

    /// Every completed critical section either committed or took the
    /// fallback, and the fallback is only ever taken after aborting at
    /// least once — except in an environment where transactions never
    /// start at all, in which case there are no aborts and no elisions.
    fn consistent(&self, total_ops: u64) -> bool {
        if self.locks_acquired() + self.locks_elided() != total_ops {
            return false;
        }
        let aborts = self.total_aborts();
        self.locks_acquired() <= aborts || (aborts == 0 && self.locks_elided() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_profile_is_always_consistent() {
        let mut p = NullProfile::new();
        p.note_unlock();
        p.accumulate(&NullProfile::new());
        assert!(p.consistent(0));
        assert!(p.consistent(12345));
    }

    #[test]
    fn lock_profile_counts_unlocks() {
        let mut p = LockProfile::new();
        for _ in 0..3 {
            p.note_unlock();
        }
        assert_eq!(p.locks_acquired(), 3);
        assert!(p.consistent(3));
        assert!(!p.consistent(4));

        let mut total = LockProfile::new();
        total.accumulate(&p);
        total.accumulate(&p);
        assert!(total.consistent(6));
    }

    #[test]
    fn htm_profile_classifies_aborts() {
        let mut p = HtmProfile::new();
        p.note_abort(Status::CONFLICT | Status::RETRY);
        p.note_abort(Status::EXPLICIT.with_code(crate::htm::LOCK_HELD));
        p.note_abort(Status::CAPACITY);
        p.note_abort(Status::NESTED);
        p.note_abort(Status::UNKNOWN);
        // conflict wins over explicit when both bits are present
        p.note_abort(Status::CONFLICT | Status::EXPLICIT);

        assert_eq!(p.conflict_aborts(), 2);
        assert_eq!(p.explicit_aborts(), 1);
        assert_eq!(p.capacity_aborts(), 1);
        assert_eq!(p.nested_aborts(), 1);
        assert_eq!(p.other_aborts(), 1);
        assert_eq!(p.total_aborts(), 6);
    }

    #[test]
    fn htm_profile_consistency() {
        // every section elided, no aborts: consistent
        let mut p = HtmProfile::new();
        p.note_commit();
        p.note_commit();
        assert!(p.consistent(2));

        // a fallback acquisition requires at least one abort...
        let mut p = HtmProfile::new();
        p.note_unlock();
        assert!(!p.consistent(1));

        // ...unless transactions never start at all
        let mut p = HtmProfile::new();
        p.note_abort(Status::UNKNOWN);
        p.note_unlock();
        assert!(p.consistent(1));

        // mixed run: aborts bound the fallback count from above
        let mut p = HtmProfile::new();
        p.note_abort(Status::CONFLICT);
        p.note_abort(Status::CONFLICT);
        p.note_unlock();
        p.note_commit();
        assert!(p.consistent(2));
        assert!(!p.consistent(3));

        // elisions present but a fallback taken without any abort: rejected
        let mut p = HtmProfile::new();
        p.note_commit();
        p.note_unlock();
        assert!(!p.consistent(2));
    }

    #[test]
    fn htm_profile_accumulate() {
        let mut a = HtmProfile::new();
        a.note_abort(Status::CONFLICT);
        a.note_unlock();

        let mut b = HtmProfile::new();
        b.note_commit();

        let mut total = HtmProfile::new();
        total.accumulate(&a);
        total.accumulate(&b);
        assert_eq!(total.locks_acquired(), 1);
        assert_eq!(total.locks_elided(), 1);
        assert_eq!(total.total_aborts(), 1);
        assert!(total.consistent(2));
    }
}
