//! Raw spinning lock words.
//!
//! These are the lock words underneath the mutex types in [`mutex`] and
//! [`shared`]: a test-and-set [`Spinlock`] and a writer-priority
//! [`RwSpinlock`]. They hold no data and hand out no guards; callers pair
//! every acquire with a matching release themselves.
//!
//! Beyond the usual acquire/release operations, both locks expose two
//! *load-only* observers that the lock-elision protocol is built on:
//!
//! - [`Spinlock::is_locked`] reads the lock word without writing to it, so a
//!   hardware transaction can pull the word into its read-set. Any thread
//!   that later acquires the lock conflicts with that read and aborts the
//!   transaction.
//! - [`Spinlock::unlock_wait`] spins until the word is observed free, again
//!   without writing. Elision uses it to avoid starting transactions that
//!   are guaranteed to abort because the fallback is currently held.
//!
//! On `aarch64`, the wait loops are hand-lowered to
//! `sevl`/`wfe`/`ldaxr`/`stxr` sequences so a waiting core sleeps on the
//! event stream instead of hammering the cache line. All other targets (and
//! all loom builds) use the portable atomic forms.
//!
//! [`mutex`]: crate::mutex
//! [`shared`]: crate::shared

use crate::loom::sync::atomic::{AtomicU32, Ordering::*};
use core::fmt;

/// A test-and-set spinlock.
///
/// The word holds 0 when the lock is free and 1 while it is held. Acquiring
/// spins with a test-and-test-and-set loop: one compare-exchange per
/// attempt, then load-only spinning with exponential backoff while the lock
/// remains held, so only one write to the line is made per acquisition
/// attempt.
pub struct Spinlock {
    lock: AtomicU32,
}

const FREE: u32 = 0;
const HELD: u32 = 1;

// === impl Spinlock ===

impl Spinlock {
    loom_const_fn! {
        /// Returns a new `Spinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { lock: AtomicU32::new(FREE) }
        }
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// On return, all memory operations of the previous holder's critical
    /// section happen-before this thread's subsequent operations.
    pub fn lock(&self) {
        #[cfg(all(target_arch = "aarch64", not(loom)))]
        {
            // Wait on the event stream: ldaxr arms the exclusive monitor,
            // and a store to the word by the releasing core generates the
            // event that wakes the wfe.
            unsafe {
                core::arch::asm!(
                    "sevl",
                    "prfm pstl1strm, [{ptr}]",
                    "2:",
                    "wfe",
                    "3:",
                    "ldaxr {tmp:w}, [{ptr}]",
                    "cbnz {tmp:w}, 2b",
                    "stxr {tmp:w}, {held:w}, [{ptr}]",
                    "cbnz {tmp:w}, 3b",
                    ptr = in(reg) self.lock.as_ptr(),
                    held = in(reg) HELD,
                    tmp = out(reg) _,
                    options(nostack),
                );
            }
        }
        #[cfg(not(all(target_arch = "aarch64", not(loom))))]
        {
            use crate::util::Backoff;
            let mut boff = Backoff::new();
            while test_dbg!(self
                .lock
                .compare_exchange(FREE, HELD, Acquire, Acquire)
                .is_err())
            {
                while self.is_locked() {
                    boff.spin();
                }
            }
        }
    }

    /// Acquires the lock with a plain store, skipping the spin loop.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the lock is free *and* that no other
    /// thread can be attempting to acquire it concurrently. The elided
    /// shared mutex uses this for its writer flag, which is only ever
    /// contended by writers and only touched while the reader/writer lock
    /// is held exclusively.
    pub unsafe fn lock_uncontended(&self) {
        test_dbg!(self.lock.store(HELD, Release));
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// This may only be called by the lock's current holder.
    pub unsafe fn unlock(&self) {
        test_dbg!(self.lock.store(FREE, Release));
    }

    /// Returns `true` if the lock was held at the moment of the load.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Acquire) != FREE
    }

    /// Spins until the lock is observed free at least once, without writing
    /// to the lock word.
    ///
    /// Returns immediately if the lock is already free. A subsequent
    /// [`lock`](Self::lock) may still fail to acquire: another thread can
    /// take the lock between the observation and the attempt.
    pub fn unlock_wait(&self) {
        #[cfg(all(target_arch = "aarch64", not(loom)))]
        {
            unsafe {
                core::arch::asm!(
                    "sevl",
                    "2:",
                    "wfe",
                    "ldaxr {tmp:w}, [{ptr}]",
                    "cbnz {tmp:w}, 2b",
                    ptr = in(reg) self.lock.as_ptr(),
                    tmp = out(reg) _,
                    options(nostack),
                );
            }
        }
        #[cfg(not(all(target_arch = "aarch64", not(loom))))]
        {
            use crate::util::Backoff;
            let mut boff = Backoff::new();
            while self.is_locked() {
                boff.spin();
            }
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Spinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A reader/writer spinlock with writer priority.
///
/// The lock word is packed as:
///
/// - bit 0 — an *active* writer holds the lock exclusively,
/// - bit 1 — a *pending* writer is waiting; new readers must hold off,
/// - bits 2.. — the count of active readers.
///
/// A waiting writer raises the pending bit before every wait iteration, so
/// a steady stream of readers cannot starve it indefinitely. Releasing the
/// writer clears the active and pending bits in a single atomic step, which
/// gives already-waiting readers a chance to slip in before the next writer
/// re-announces itself.
pub struct RwSpinlock {
    state: AtomicU32,
}

const WRITER: u32 = 1 << 0;
const PENDING: u32 = 1 << 1;
const READER: u32 = 1 << 2;

// === impl RwSpinlock ===

impl RwSpinlock {
    loom_const_fn! {
        /// Returns a new `RwSpinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicU32::new(0) }
        }
    }

    /// Returns the number of readers currently holding the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        (self.state.load(Relaxed) >> 2) as usize
    }

    /// Acquires the lock for shared read access, spinning while a writer is
    /// active or pending.
    pub fn lock_shared(&self) {
        #[cfg(all(target_arch = "aarch64", not(loom)))]
        {
            unsafe {
                core::arch::asm!(
                    "sevl",
                    "prfm pstl1strm, [{ptr}]",
                    "2:",
                    "wfe",
                    "3:",
                    "ldaxr {tmp:w}, [{ptr}]",
                    "tst {tmp:w}, #0x3",
                    "b.ne 2b",
                    "add {next:w}, {tmp:w}, #0x4",
                    "stlxr {tmp:w}, {next:w}, [{ptr}]",
                    "cbnz {tmp:w}, 3b",
                    ptr = in(reg) self.state.as_ptr(),
                    tmp = out(reg) _,
                    next = out(reg) _,
                    options(nostack),
                );
            }
        }
        #[cfg(not(all(target_arch = "aarch64", not(loom))))]
        {
            use crate::util::Backoff;
            let mut boff = Backoff::new();
            loop {
                let state = test_dbg!(self.state.load(Acquire));
                if state & (WRITER | PENDING) == 0 {
                    let prev = test_dbg!(self.state.fetch_add(READER, Acquire));
                    assert!(
                        prev < u32::MAX - (READER * 2),
                        "read lock counter overflow! this is very bad"
                    );
                    if prev & WRITER == 0 {
                        return;
                    }
                    // a writer got there first; undo the increment and wait
                    test_dbg!(self.state.fetch_sub(READER, Release));
                }
                boff.spin();
            }
        }
    }

    /// Releases one shared hold on the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock for shared access.
    pub unsafe fn unlock_shared(&self) {
        let _prev = test_dbg!(self.state.fetch_sub(READER, Release));
        debug_assert_eq!(
            _prev & WRITER,
            0,
            "released a read lock while a writer was active, something is Very Wrong!"
        );
    }

    /// Acquires the lock for exclusive write access, spinning while readers
    /// or another writer hold it.
    pub fn lock_exclusive(&self) {
        #[cfg(all(target_arch = "aarch64", not(loom)))]
        {
            unsafe {
                core::arch::asm!(
                    "sevl",
                    "prfm pstl1strm, [{ptr}]",
                    "2:",
                    "wfe",
                    "3:",
                    "ldaxr {tmp:w}, [{ptr}]",
                    // free if nothing but the pending bit is set
                    "tst {tmp:w}, #0xfffffffd",
                    "b.eq 4f",
                    // pending already raised? keep waiting
                    "tbnz {tmp:w}, #1, 2b",
                    "orr {next:w}, {tmp:w}, #0x2",
                    "stlxr {tmp:w}, {next:w}, [{ptr}]",
                    "b 3b",
                    "4:",
                    "stlxr {tmp:w}, {writer:w}, [{ptr}]",
                    "cbnz {tmp:w}, 3b",
                    ptr = in(reg) self.state.as_ptr(),
                    writer = in(reg) WRITER,
                    tmp = out(reg) _,
                    next = out(reg) _,
                    options(nostack),
                );
            }
        }
        #[cfg(not(all(target_arch = "aarch64", not(loom))))]
        {
            use crate::util::Backoff;
            let mut boff = Backoff::new();
            loop {
                let state = test_dbg!(self.state.load(Acquire));
                if state & !PENDING == 0 {
                    // no readers, no active writer; claim the lock and
                    // clear any pending flag in the same step
                    if test_dbg!(self
                        .state
                        .compare_exchange(state, WRITER, Acquire, Relaxed)
                        .is_ok())
                    {
                        return;
                    }
                } else if state & PENDING == 0 {
                    // announce intent so new readers hold off
                    test_dbg!(self.state.fetch_or(PENDING, Relaxed));
                }
                boff.spin();
            }
        }
    }

    /// Releases exclusive write access.
    ///
    /// Clears the active *and* pending writer bits in one atomic step, so
    /// waiting readers get a chance before any newly arriving writer
    /// observes the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock exclusively.
    pub unsafe fn unlock_exclusive(&self) {
        test_dbg!(self.state.fetch_and(!(WRITER | PENDING), Release));
    }

    /// Returns `true` if any reader or writer held (or a writer was
    /// pending on) the lock at the moment of the load.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Acquire) != 0
    }

    /// Spins until the lock word is observed fully quiescent (no readers,
    /// no active or pending writer), without writing to it.
    pub fn unlock_wait(&self) {
        #[cfg(all(target_arch = "aarch64", not(loom)))]
        {
            unsafe {
                core::arch::asm!(
                    "sevl",
                    "2:",
                    "wfe",
                    "ldaxr {tmp:w}, [{ptr}]",
                    "cbnz {tmp:w}, 2b",
                    ptr = in(reg) self.state.as_ptr(),
                    tmp = out(reg) _,
                    options(nostack),
                );
            }
        }
        #[cfg(not(all(target_arch = "aarch64", not(loom))))]
        {
            use crate::util::Backoff;
            let mut boff = Backoff::new();
            while self.is_locked() {
                boff.spin();
            }
        }
    }
}

impl Default for RwSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwSpinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // N.B.: a single load snapshots the whole word; independent reads of
        // the reader count and writer bits could interleave with concurrent
        // lock operations and display a state the lock was never in.
        let state = self.state.load(Relaxed);
        f.debug_struct("RwSpinlock")
            .field("readers", &(state >> 2))
            .field("writer", &(state & WRITER != 0))
            .field("pending_writer", &(state & PENDING != 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, cell::UnsafeCell, sync::Arc, thread};

    #[test]
    fn unlock_wait_returns_immediately_when_free() {
        loom::model(|| {
            let lock = Spinlock::new();
            lock.unlock_wait();

            let rw = RwSpinlock::new();
            rw.unlock_wait();
        });
    }

    #[test]
    fn spinlock_lock_unlock() {
        loom::model(|| {
            let lock = Spinlock::new();
            assert!(!lock.is_locked());

            lock.lock();
            assert!(lock.is_locked());

            unsafe { lock.unlock() };
            assert!(!lock.is_locked());
            lock.unlock_wait();
        });
    }

    #[test]
    fn rwlock_shared_holds() {
        loom::model(|| {
            let lock = RwSpinlock::new();

            lock.lock_shared();
            lock.lock_shared();
            assert_eq!(lock.reader_count(), 2);
            assert!(lock.is_locked());

            unsafe { lock.unlock_shared() };
            assert_eq!(lock.reader_count(), 1);

            unsafe { lock.unlock_shared() };
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn rwlock_exclusive_holds() {
        loom::model(|| {
            let lock = RwSpinlock::new();

            lock.lock_exclusive();
            assert!(lock.is_locked());
            assert_eq!(lock.reader_count(), 0);

            unsafe { lock.unlock_exclusive() };
            assert!(!lock.is_locked());
            lock.unlock_wait();
        });
    }

    #[test]
    fn spinlock_mutual_exclusion() {
        struct Guarded {
            lock: Spinlock,
            value: UnsafeCell<usize>,
        }
        unsafe impl Sync for Guarded {}

        loom::model(|| {
            let guarded = Arc::new(Guarded {
                lock: Spinlock::new(),
                value: UnsafeCell::new(0),
            });

            let threads = (0..2)
                .map(|_| {
                    let guarded = guarded.clone();
                    thread::spawn(move || {
                        guarded.lock.lock();
                        guarded.value.with_mut(|v| unsafe { *v += 1 });
                        unsafe { guarded.lock.unlock() };
                    })
                })
                .collect::<Vec<_>>();

            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(guarded.value.with_mut(|v| unsafe { *v }), 2);
        });
    }

    #[test]
    fn rwlock_writer_exclusion() {
        struct Guarded {
            lock: RwSpinlock,
            value: UnsafeCell<usize>,
        }
        unsafe impl Sync for Guarded {}

        loom::model(|| {
            let guarded = Arc::new(Guarded {
                lock: RwSpinlock::new(),
                value: UnsafeCell::new(0),
            });

            let writers = (0..2)
                .map(|_| {
                    let guarded = guarded.clone();
                    thread::spawn(move || {
                        guarded.lock.lock_exclusive();
                        guarded.value.with_mut(|v| unsafe { *v += 1 });
                        unsafe { guarded.lock.unlock_exclusive() };
                    })
                })
                .collect::<Vec<_>>();

            {
                guarded.lock.lock_shared();
                let v = guarded.value.with(|v| unsafe { *v });
                assert!(v <= 2);
                unsafe { guarded.lock.unlock_shared() };
            }

            for t in writers {
                t.join().unwrap();
            }

            guarded.lock.lock_shared();
            assert_eq!(guarded.value.with(|v| unsafe { *v }), 2);
            unsafe { guarded.lock.unlock_shared() };
        });
    }
}
