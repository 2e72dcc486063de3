//! Reader/writer mutual-exclusion locks, operated through per-thread
//! handles.
//!
//! The same three flavors as [`mutex`](crate::mutex), extended with shared
//! (read) access:
//!
//! - [`NullSharedMutex`] synchronizes nothing,
//! - [`SpinSharedMutex`] is a writer-priority reader/writer spinlock,
//! - [`HtmSpinSharedMutex`] elides that spinlock with hardware
//!   transactions.
//!
//! # Elision and the writer flag
//!
//! The elided flavor keeps *two* lock words:
//!
//! - `state`, the [`RwSpinlock`] that fallback readers and writers
//!   actually acquire, and
//! - `writer_flag`, an auxiliary single-bit [`Spinlock`] set only while a
//!   fallback writer is inside its critical section.
//!
//! Elided *writers* subscribe to `state`: they must abort if any reader or
//! writer holds the fallback. Elided *readers* subscribe only to
//! `writer_flag`. They must not read `state`, because fallback readers
//! mutate its reader count — every fallback read acquisition would then
//! abort all concurrently elided readers, and elision of read-mostly
//! workloads would never pay off. The flag gives readers a word that only
//! writers touch, on its own cache line.
//!
//! A fallback writer therefore acquires `state` exclusively *then* sets
//! `writer_flag` (uncontended: `state` already serializes writers), and
//! releases the flag *before* `state` — if `state` were released first, a
//! fallback reader could be admitted while the flag still aborts every
//! elided reader, and a freshly started elided reader could miss the
//! flag of a writer still inside its section.

use crate::{
    htm,
    lock::{Lockable, SharedLockable},
    mutex::{HandleState, TrackedState, DEFAULT_RETRY_LIMIT},
    profile::{HtmProfile, LockProfile, NullProfile, Profile},
    spin::{RwSpinlock, Spinlock},
    user_abort,
    util::CachePadded,
};
use core::fmt;

/// A reader/writer mutex that performs no synchronization.
///
/// Like [`NullMutex`](crate::mutex::NullMutex), but with the shared-access
/// surface, so it can stand in for either real reader/writer flavor.
#[derive(Debug, Default)]
pub struct NullSharedMutex(());

// === impl NullSharedMutex ===

impl NullSharedMutex {
    /// Returns a new `NullSharedMutex`.
    #[must_use]
    pub const fn new() -> Self {
        Self(())
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> NullSharedMutexHandle<'_> {
        NullSharedMutexHandle {
            mutex: self,
            profile: None,
            state: TrackedState::new(),
        }
    }

    /// Binds a new handle to this mutex, updating `profile` as it is used.
    #[must_use]
    pub fn handle_with_profile<'a>(
        &'a self,
        profile: &'a mut NullProfile,
    ) -> NullSharedMutexHandle<'a> {
        NullSharedMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: TrackedState::new(),
        }
    }
}

/// A per-thread handle to a [`NullSharedMutex`].
pub struct NullSharedMutexHandle<'a> {
    mutex: &'a NullSharedMutex,
    profile: Option<&'a mut NullProfile>,
    state: TrackedState,
}

// === impl NullSharedMutexHandle ===

impl NullSharedMutexHandle<'_> {
    /// "Acquires" the mutex exclusively. Does nothing but update the
    /// handle state.
    pub fn lock(&mut self) {
        self.state.assert_may_lock();
        self.state.set(HandleState::LockedUnique);
    }

    /// "Releases" the exclusive hold.
    pub fn unlock(&mut self) {
        self.state.assert_is(HandleState::LockedUnique);
        self.state.set(HandleState::Unlocked);
        if let Some(p) = self.profile.as_deref_mut() {
            p.note_unlock();
        }
    }

    /// "Acquires" the mutex for shared access.
    pub fn lock_shared(&mut self) {
        self.state.assert_may_lock();
        self.state.set(HandleState::LockedShared);
    }

    /// "Releases" the shared hold.
    pub fn unlock_shared(&mut self) {
        self.state.assert_is(HandleState::LockedShared);
        self.state.set(HandleState::Unlocked);
        if let Some(p) = self.profile.as_deref_mut() {
            p.note_unlock();
        }
    }

    /// Returns the handle's current state. Only tracked in debug builds.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state.get()
    }
}

impl Lockable for NullSharedMutexHandle<'_> {
    fn lock(&mut self) {
        NullSharedMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        NullSharedMutexHandle::unlock(self)
    }
}

impl SharedLockable for NullSharedMutexHandle<'_> {
    fn lock_shared(&mut self) {
        NullSharedMutexHandle::lock_shared(self)
    }

    fn unlock_shared(&mut self) {
        NullSharedMutexHandle::unlock_shared(self)
    }
}

impl fmt::Debug for NullSharedMutexHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullSharedMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}

/// A reader/writer spinlock mutex.
pub struct SpinSharedMutex {
    state: CachePadded<RwSpinlock>,
}

// === impl SpinSharedMutex ===

impl SpinSharedMutex {
    loom_const_fn! {
        /// Returns a new `SpinSharedMutex`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { state: CachePadded::new(RwSpinlock::new()) }
        }
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> SpinSharedMutexHandle<'_> {
        SpinSharedMutexHandle {
            mutex: self,
            profile: None,
            state: TrackedState::new(),
        }
    }

    /// Binds a new handle to this mutex, updating `profile` as it is used.
    #[must_use]
    pub fn handle_with_profile<'a>(
        &'a self,
        profile: &'a mut LockProfile,
    ) -> SpinSharedMutexHandle<'a> {
        SpinSharedMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: TrackedState::new(),
        }
    }

    /// Returns `true` if any reader or writer held (or a writer was
    /// pending on) the mutex at the moment of the load.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Returns the number of readers currently holding the mutex.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.reader_count()
    }
}

impl Default for SpinSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinSharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinSharedMutex")
            .field("state", &self.state)
            .finish()
    }
}

/// A per-thread handle to a [`SpinSharedMutex`].
pub struct SpinSharedMutexHandle<'a> {
    mutex: &'a SpinSharedMutex,
    profile: Option<&'a mut LockProfile>,
    state: TrackedState,
}

// === impl SpinSharedMutexHandle ===

impl SpinSharedMutexHandle<'_> {
    /// Acquires the mutex exclusively, spinning until no reader or writer
    /// holds it.
    pub fn lock(&mut self) {
        self.state.assert_may_lock();
        self.mutex.state.lock_exclusive();
        self.state.set(HandleState::LockedUnique);
    }

    /// Releases the exclusive hold.
    pub fn unlock(&mut self) {
        self.state.assert_is(HandleState::LockedUnique);
        // SAFETY: this handle acquired the lock exclusively in `lock`.
        unsafe { self.mutex.state.unlock_exclusive() };
        self.state.set(HandleState::Unlocked);
        if let Some(p) = self.profile.as_deref_mut() {
            p.note_unlock();
        }
    }

    /// Acquires the mutex for shared access, spinning while a writer is
    /// active or pending.
    pub fn lock_shared(&mut self) {
        self.state.assert_may_lock();
        self.mutex.state.lock_shared();
        self.state.set(HandleState::LockedShared);
    }

    /// Releases the shared hold.
    pub fn unlock_shared(&mut self) {
        self.state.assert_is(HandleState::LockedShared);
        // SAFETY: this handle acquired the lock for shared access in
        // `lock_shared`.
        unsafe { self.mutex.state.unlock_shared() };
        self.state.set(HandleState::Unlocked);
        if let Some(p) = self.profile.as_deref_mut() {
            p.note_unlock();
        }
    }

    /// Returns the handle's current state. Only tracked in debug builds.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state.get()
    }
}

impl Lockable for SpinSharedMutexHandle<'_> {
    fn lock(&mut self) {
        SpinSharedMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        SpinSharedMutexHandle::unlock(self)
    }
}

impl SharedLockable for SpinSharedMutexHandle<'_> {
    fn lock_shared(&mut self) {
        SpinSharedMutexHandle::lock_shared(self)
    }

    fn unlock_shared(&mut self) {
        SpinSharedMutexHandle::unlock_shared(self)
    }
}

impl fmt::Debug for SpinSharedMutexHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinSharedMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}

/// A reader/writer mutex that elides its spinlock with hardware
/// transactions.
///
/// Exclusive and shared sections are first attempted inside a hardware
/// transaction; see the [module docs](self#elision-and-the-writer-flag)
/// for the two-word protocol. `WRITE_RETRY_LIMIT` and `READ_RETRY_LIMIT`
/// bound the transactional attempts of the exclusive and shared paths
/// respectively; a limit of 0 disables elision for that path.
pub struct HtmSpinSharedMutex<
    const WRITE_RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT,
    const READ_RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT,
> {
    state: CachePadded<RwSpinlock>,
    writer_flag: CachePadded<Spinlock>,
}

// === impl HtmSpinSharedMutex ===

impl HtmSpinSharedMutex {
    loom_const_fn! {
        /// Returns a new `HtmSpinSharedMutex` with the default retry
        /// limits.
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: CachePadded::new(RwSpinlock::new()),
                writer_flag: CachePadded::new(Spinlock::new()),
            }
        }
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize>
    HtmSpinSharedMutex<WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    loom_const_fn! {
        /// Returns a new mutex whose per-acquisition transactional attempt
        /// budgets are the `WRITE_RETRY_LIMIT` and `READ_RETRY_LIMIT` type
        /// parameters.
        #[must_use]
        pub fn with_retry_limits() -> Self {
            Self {
                state: CachePadded::new(RwSpinlock::new()),
                writer_flag: CachePadded::new(Spinlock::new()),
            }
        }
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> HtmSpinSharedMutexHandle<'_, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT> {
        HtmSpinSharedMutexHandle {
            mutex: self,
            profile: None,
            state: HandleState::Unknown,
        }
    }

    /// Binds a new handle to this mutex, updating `profile` as it is used.
    #[must_use]
    pub fn handle_with_profile<'a>(
        &'a self,
        profile: &'a mut HtmProfile,
    ) -> HtmSpinSharedMutexHandle<'a, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT> {
        HtmSpinSharedMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: HandleState::Unknown,
        }
    }

    /// Returns `true` if the fallback reader/writer lock was held at the
    /// moment of the load. Elided critical sections do not hold it.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize> Default
    for HtmSpinSharedMutex<WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    fn default() -> Self {
        Self::with_retry_limits()
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize> fmt::Debug
    for HtmSpinSharedMutex<WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmSpinSharedMutex")
            .field("state", &self.state)
            .field("writer_flag", &self.writer_flag)
            .field("write_retry_limit", &WRITE_RETRY_LIMIT)
            .field("read_retry_limit", &READ_RETRY_LIMIT)
            .finish()
    }
}

/// A per-thread handle to an [`HtmSpinSharedMutex`].
///
/// Tracks its [`HandleState`] in every build: releasing must know whether
/// to commit a transaction, release the fallback write hold, or decrement
/// the fallback reader count.
pub struct HtmSpinSharedMutexHandle<
    'a,
    const WRITE_RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT,
    const READ_RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT,
> {
    mutex: &'a HtmSpinSharedMutex<WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>,
    profile: Option<&'a mut HtmProfile>,
    state: HandleState,
}

// === impl HtmSpinSharedMutexHandle ===

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize>
    HtmSpinSharedMutexHandle<'_, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    /// Acquires the mutex exclusively: transactionally if possible, by
    /// taking the fallback reader/writer lock otherwise.
    pub fn lock(&mut self) {
        debug_assert!(
            matches!(self.state, HandleState::Unknown | HandleState::Unlocked),
            "locked a handle that is already {:?}",
            self.state
        );
        let mut attempts = 0;
        while attempts < WRITE_RETRY_LIMIT {
            self.mutex.state.unlock_wait();
            let status = htm::begin();
            if status.is_started() {
                // Subscribe to the whole reader/writer word: an elided
                // writer must abort on fallback readers too.
                if self.mutex.state.is_locked() {
                    user_abort!(crate::htm::LOCK_HELD);
                }
                self.state = HandleState::Elided;
                return;
            }
            attempts += 1;
            test_debug!(?status, attempts, "exclusive transaction aborted");
            if let Some(p) = self.profile.as_deref_mut() {
                p.note_abort(status);
            }
            if !status.is_restartable() {
                break;
            }
        }
        trace!(attempts, "elision failed; acquiring the fallback rw-lock");
        self.mutex.state.lock_exclusive();
        // Holding the rw-lock exclusively serializes writers, so no other
        // thread can be contending for the flag right now.
        debug_assert!(!self.mutex.writer_flag.is_locked());
        // SAFETY: uncontended per the invariant above.
        unsafe { self.mutex.writer_flag.lock_uncontended() };
        self.state = HandleState::LockedUnique;
    }

    /// Releases the exclusive hold: commits the transaction if this
    /// section was elided, releases the writer flag and the fallback lock
    /// if it was not.
    pub fn unlock(&mut self) {
        match self.state {
            HandleState::Elided => {
                htm::commit();
                if let Some(p) = self.profile.as_deref_mut() {
                    if !htm::in_transaction() {
                        p.note_commit();
                    }
                }
            }
            HandleState::LockedUnique => {
                // Flag first: readers admitted by the rw-lock release must
                // not find it still set.
                // SAFETY: this handle set the flag in `lock`.
                unsafe { self.mutex.writer_flag.unlock() };
                // SAFETY: this handle acquired the rw-lock exclusively in
                // `lock`.
                unsafe { self.mutex.state.unlock_exclusive() };
                if let Some(p) = self.profile.as_deref_mut() {
                    p.note_unlock();
                }
            }
            _state => unreachable_unchecked!("released a handle in state {:?}", _state),
        }
        self.state = HandleState::Unlocked;
    }

    /// Acquires the mutex for shared access: transactionally if possible,
    /// by taking a fallback read hold otherwise.
    pub fn lock_shared(&mut self) {
        debug_assert!(
            matches!(self.state, HandleState::Unknown | HandleState::Unlocked),
            "locked a handle that is already {:?}",
            self.state
        );
        let mut attempts = 0;
        while attempts < READ_RETRY_LIMIT {
            self.mutex.writer_flag.unlock_wait();
            let status = htm::begin();
            if status.is_started() {
                // Subscribe to the writer flag only; the reader count in
                // the rw-lock word is mutated by fallback readers and
                // would make elided readers abort each other.
                if self.mutex.writer_flag.is_locked() {
                    user_abort!(crate::htm::LOCK_HELD);
                }
                self.state = HandleState::Elided;
                return;
            }
            attempts += 1;
            test_debug!(?status, attempts, "shared transaction aborted");
            if let Some(p) = self.profile.as_deref_mut() {
                p.note_abort(status);
            }
            if !status.is_restartable() {
                break;
            }
        }
        trace!(attempts, "elision failed; taking a fallback read hold");
        self.mutex.state.lock_shared();
        self.state = HandleState::LockedShared;
    }

    /// Releases the shared hold: commits the transaction if this section
    /// was elided, decrements the fallback reader count if it was not.
    pub fn unlock_shared(&mut self) {
        match self.state {
            HandleState::Elided => {
                htm::commit();
                if let Some(p) = self.profile.as_deref_mut() {
                    if !htm::in_transaction() {
                        p.note_commit();
                    }
                }
            }
            HandleState::LockedShared => {
                // SAFETY: this handle took a read hold in `lock_shared`.
                unsafe { self.mutex.state.unlock_shared() };
                if let Some(p) = self.profile.as_deref_mut() {
                    p.note_unlock();
                }
            }
            _state => unreachable_unchecked!("released a handle in state {:?}", _state),
        }
        self.state = HandleState::Unlocked;
    }

    /// Returns the handle's current state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize> Lockable
    for HtmSpinSharedMutexHandle<'_, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    fn lock(&mut self) {
        HtmSpinSharedMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        HtmSpinSharedMutexHandle::unlock(self)
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize> SharedLockable
    for HtmSpinSharedMutexHandle<'_, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    fn lock_shared(&mut self) {
        HtmSpinSharedMutexHandle::lock_shared(self)
    }

    fn unlock_shared(&mut self) {
        HtmSpinSharedMutexHandle::unlock_shared(self)
    }
}

impl<const WRITE_RETRY_LIMIT: usize, const READ_RETRY_LIMIT: usize> fmt::Debug
    for HtmSpinSharedMutexHandle<'_, WRITE_RETRY_LIMIT, READ_RETRY_LIMIT>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmSpinSharedMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, cell::UnsafeCell, sync::Arc, thread};
    use crate::util::test::{assert_send, assert_send_sync};

    const WRITERS: usize = if cfg!(loom) { 1 } else { 2 };
    const READERS: usize = if cfg!(loom) { 1 } else { 4 };
    const OPS: usize = if cfg!(loom) { 2 } else { 10_000 };

    struct Counter<M> {
        mutex: M,
        value: UnsafeCell<u64>,
    }

    unsafe impl<M: Send + Sync> Sync for Counter<M> {}

    #[test]
    fn mutexes_are_send_and_sync() {
        assert_send_sync::<NullSharedMutex>();
        assert_send_sync::<SpinSharedMutex>();
        assert_send_sync::<HtmSpinSharedMutex>();
        assert_send::<NullSharedMutexHandle<'_>>();
        assert_send::<SpinSharedMutexHandle<'_>>();
        assert_send::<HtmSpinSharedMutexHandle<'_>>();
    }

    #[test]
    fn null_shared_mutex_state_machine() {
        loom::model(|| {
            let mutex = NullSharedMutex::new();
            let mut handle = mutex.handle();

            handle.lock();
            #[cfg(debug_assertions)]
            assert_eq!(handle.state(), HandleState::LockedUnique);
            handle.unlock();

            handle.lock_shared();
            #[cfg(debug_assertions)]
            assert_eq!(handle.state(), HandleState::LockedShared);
            handle.unlock_shared();
            #[cfg(debug_assertions)]
            assert_eq!(handle.state(), HandleState::Unlocked);
        });
    }

    #[test]
    fn spin_shared_mutex_writers() {
        loom::model(|| {
            let shared = Arc::new(Counter {
                mutex: SpinSharedMutex::new(),
                value: UnsafeCell::new(0),
            });

            let threads = (0..2)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut profile = LockProfile::new();
                        let mut handle = shared.mutex.handle_with_profile(&mut profile);
                        for _ in 0..OPS {
                            handle.lock();
                            shared.value.with_mut(|v| unsafe { *v += 1 });
                            handle.unlock();
                        }
                        drop(handle);
                        profile
                    })
                })
                .collect::<Vec<_>>();

            let mut total = LockProfile::new();
            for t in threads {
                total.accumulate(&t.join().unwrap());
            }

            let expected = (2 * OPS) as u64;
            assert_eq!(shared.value.with_mut(|v| unsafe { *v }), expected);
            assert!(total.consistent(expected));
        });
    }

    #[test]
    fn spin_shared_mutex_readers_and_writers() {
        loom::model(|| {
            let shared = Arc::new(Counter {
                mutex: SpinSharedMutex::new(),
                value: UnsafeCell::new(0),
            });

            let writers = (0..WRITERS)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut handle = shared.mutex.handle();
                        for _ in 0..OPS {
                            handle.lock();
                            shared.value.with_mut(|v| unsafe { *v += 1 });
                            handle.unlock();
                        }
                    })
                })
                .collect::<Vec<_>>();

            let readers = (0..READERS)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut handle = shared.mutex.handle();
                        let mut last = 0;
                        for _ in 0..OPS {
                            handle.lock_shared();
                            let v = shared.value.with(|v| unsafe { *v });
                            handle.unlock_shared();
                            // each reader observes a non-decreasing count
                            assert!(v >= last);
                            last = v;
                        }
                    })
                })
                .collect::<Vec<_>>();

            for t in writers.into_iter().chain(readers) {
                t.join().unwrap();
            }

            let expected = (WRITERS * OPS) as u64;
            assert_eq!(shared.value.with_mut(|v| unsafe { *v }), expected);
            assert!(!shared.mutex.is_locked());
            assert_eq!(shared.mutex.reader_count(), 0);
        });
    }

    #[test]
    fn htm_shared_mutex_writers() {
        loom::model(|| {
            let shared = Arc::new(Counter {
                mutex: HtmSpinSharedMutex::new(),
                value: UnsafeCell::new(0),
            });

            let threads = (0..2)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut profile = HtmProfile::new();
                        let mut handle = shared.mutex.handle_with_profile(&mut profile);
                        for _ in 0..OPS {
                            handle.lock();
                            shared.value.with_mut(|v| unsafe { *v += 1 });
                            handle.unlock();
                        }
                        drop(handle);
                        profile
                    })
                })
                .collect::<Vec<_>>();

            let mut total = HtmProfile::new();
            for t in threads {
                total.accumulate(&t.join().unwrap());
            }

            let expected = (2 * OPS) as u64;
            assert_eq!(shared.value.with_mut(|v| unsafe { *v }), expected);
            assert_eq!(total.locks_acquired() + total.locks_elided(), expected);
            assert!(total.consistent(expected));
        });
    }

    #[test]
    fn htm_shared_mutex_readers_and_writers() {
        loom::model(|| {
            let shared = Arc::new(Counter {
                mutex: HtmSpinSharedMutex::new(),
                value: UnsafeCell::new(0),
            });

            let writers = (0..WRITERS)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut profile = HtmProfile::new();
                        let mut handle = shared.mutex.handle_with_profile(&mut profile);
                        for _ in 0..OPS {
                            handle.lock();
                            shared.value.with_mut(|v| unsafe { *v += 1 });
                            handle.unlock();
                        }
                        drop(handle);
                        profile
                    })
                })
                .collect::<Vec<_>>();

            let readers = (0..READERS)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        let mut profile = HtmProfile::new();
                        let mut handle = shared.mutex.handle_with_profile(&mut profile);
                        let mut last = 0;
                        for _ in 0..OPS {
                            handle.lock_shared();
                            let v = shared.value.with(|v| unsafe { *v });
                            handle.unlock_shared();
                            assert!(v >= last);
                            last = v;
                        }
                        drop(handle);
                        profile
                    })
                })
                .collect::<Vec<_>>();

            let mut total = HtmProfile::new();
            for t in writers.into_iter().chain(readers) {
                total.accumulate(&t.join().unwrap());
            }

            let expected_writes = (WRITERS * OPS) as u64;
            let total_ops = ((WRITERS + READERS) * OPS) as u64;
            assert_eq!(shared.value.with_mut(|v| unsafe { *v }), expected_writes);
            assert_eq!(total.locks_acquired() + total.locks_elided(), total_ops);
            assert!(total.consistent(total_ops));
        });
    }

    #[test]
    fn htm_shared_mutex_retry_limit_zero_never_elides() {
        loom::model(|| {
            let mutex = HtmSpinSharedMutex::<0, 0>::with_retry_limits();
            let mut profile = HtmProfile::new();
            let mut handle = mutex.handle_with_profile(&mut profile);

            handle.lock();
            assert_eq!(handle.state(), HandleState::LockedUnique);
            handle.unlock();

            handle.lock_shared();
            assert_eq!(handle.state(), HandleState::LockedShared);
            handle.unlock_shared();
            drop(handle);

            assert_eq!(profile.locks_elided(), 0);
            assert_eq!(profile.locks_acquired(), 2);
            assert!(profile.consistent(2));
        });
    }
}
