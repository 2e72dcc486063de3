//! Exclusive mutual-exclusion locks, operated through per-thread handles.
//!
//! Three flavors share one surface:
//!
//! - [`NullMutex`] synchronizes nothing; it exists so a build can swap real
//!   locking for no locking without changing types.
//! - [`SpinMutex`] is a plain test-and-set spinlock.
//! - [`HtmSpinMutex`] elides the spinlock with hardware transactions,
//!   taking it only as a fallback after repeated aborts.
//!
//! A mutex itself only owns its lock word. To use one, each thread binds a
//! *handle* with [`handle`](SpinMutex::handle) or
//! [`handle_with_profile`](SpinMutex::handle_with_profile) and calls
//! `lock`/`unlock` on that. The handle records which way the lock was taken
//! — for the elided flavor, whether this section is running transactionally
//! or holds the fallback — so that unlock can route to the matching
//! release. A handle belongs to exactly one thread; any number of handles
//! may bind the same mutex.
//!
//! # Elision
//!
//! [`HtmSpinMutex::handle`]'s `lock` first waits (with loads only) for the
//! fallback spinlock to be free, then starts a hardware transaction and
//! *reads* the lock word instead of writing it. The read pulls the word
//! into the transaction's read-set: if any thread acquires the fallback
//! while the transaction runs, cache coherence aborts the transaction and
//! its speculative writes vanish. Seeing the word already held inside the
//! transaction triggers an explicit abort, since committing in that state
//! would race with the holder. After `RETRY_LIMIT` aborts (or one the
//! hardware deems hopeless), the thread acquires the spinlock for real.
//!
//! Critical sections of threads that *elide* the lock run concurrently;
//! mutual exclusion still holds because their write-sets are published
//! atomically at commit time, and any overlap between two sections is a
//! conflict that aborts one of them.

use crate::{
    htm,
    lock::Lockable,
    profile::{HtmProfile, LockProfile, NullProfile, Profile},
    spin::Spinlock,
    user_abort,
    util::CachePadded,
};
use core::fmt;

/// The default number of transactional attempts the elided locks make
/// before acquiring their fallback lock.
pub const DEFAULT_RETRY_LIMIT: usize = 10;

/// The lock-ownership state of a mutex handle.
///
/// A handle starts out [`Unknown`](Self::Unknown), becomes
/// [`Unlocked`](Self::Unlocked) after its first release, and from then on
/// oscillates between `Unlocked` and one of the held states. Destroying a
/// handle in a held state is a contract violation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleState {
    /// The handle has not been used yet.
    Unknown,
    /// The handle holds nothing.
    Unlocked,
    /// The handle holds its lock exclusively (for the elided flavors: it
    /// holds the *fallback* lock).
    LockedUnique,
    /// The handle holds its lock for shared access.
    LockedShared,
    /// The handle's critical section is running inside a hardware
    /// transaction; no lock is held.
    Elided,
}

/// Handle-state bookkeeping for the non-elided mutex flavors: tracked (and
/// asserted on) in debug builds, zero-sized in release builds.
///
/// The elided flavors do *not* use this — their unlock dispatches on the
/// state, so they carry a real [`HandleState`] in every build.
pub(crate) struct TrackedState {
    #[cfg(debug_assertions)]
    state: HandleState,
}

// === impl TrackedState ===

impl TrackedState {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            state: HandleState::Unknown,
        }
    }

    pub(crate) fn assert_may_lock(&self) {
        #[cfg(debug_assertions)]
        debug_assert!(
            matches!(self.state, HandleState::Unknown | HandleState::Unlocked),
            "locked a handle that is already {:?}",
            self.state
        );
    }

    pub(crate) fn assert_is(&self, expected: HandleState) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.state, expected,
            "released a handle in the wrong state"
        );
        #[cfg(not(debug_assertions))]
        let _ = expected;
    }

    pub(crate) fn set(&mut self, next: HandleState) {
        #[cfg(debug_assertions)]
        {
            self.state = next;
        }
        #[cfg(not(debug_assertions))]
        let _ = next;
    }

    #[cfg(debug_assertions)]
    pub(crate) fn get(&self) -> HandleState {
        self.state
    }
}

impl fmt::Debug for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(debug_assertions)]
        {
            self.state.fmt(f)
        }
        #[cfg(not(debug_assertions))]
        {
            f.write_str("<untracked>")
        }
    }
}

/// A mutex that performs no synchronization.
///
/// `lock` and `unlock` only maintain the handle state machine (in debug
/// builds); they provide no mutual exclusion whatsoever. This flavor
/// exists so that benchmarks and tests can measure against an
/// unsynchronized baseline without changing any types.
#[derive(Debug, Default)]
pub struct NullMutex(());

// === impl NullMutex ===

impl NullMutex {
    /// Returns a new `NullMutex`.
    #[must_use]
    pub const fn new() -> Self {
        Self(())
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> NullMutexHandle<'_> {
        NullMutexHandle {
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
    ) -> NullMutexHandle<'a> {
        NullMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: TrackedState::new(),
        }
    }
}

/// A per-thread handle to a [`NullMutex`].
pub struct NullMutexHandle<'a> {
    mutex: &'a NullMutex,
    profile: Option<&'a mut NullProfile>,
    state: TrackedState,
}

// === impl NullMutexHandle ===

impl NullMutexHandle<'_> {
    /// "Acquires" the mutex. Does nothing but update the handle state.
    pub fn lock(&mut self) {
        self.state.assert_may_lock();
        self.state.set(HandleState::LockedUnique);
    }

    /// "Releases" the mutex.
    pub fn unlock(&mut self) {
        self.state.assert_is(HandleState::LockedUnique);
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

impl Lockable for NullMutexHandle<'_> {
    fn lock(&mut self) {
        NullMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        NullMutexHandle::unlock(self)
    }
}

impl fmt::Debug for NullMutexHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}

/// A test-and-set spinlock mutex.
pub struct SpinMutex {
    state: CachePadded<Spinlock>,
}

// === impl SpinMutex ===

impl SpinMutex {
    loom_const_fn! {
        /// Returns a new `SpinMutex`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { state: CachePadded::new(Spinlock::new()) }
        }
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> SpinMutexHandle<'_> {
        SpinMutexHandle {
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
    ) -> SpinMutexHandle<'a> {
        SpinMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: TrackedState::new(),
        }
    }

    /// Returns `true` if the mutex was held at the moment of the load.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A per-thread handle to a [`SpinMutex`].
pub struct SpinMutexHandle<'a> {
    mutex: &'a SpinMutex,
    profile: Option<&'a mut LockProfile>,
    state: TrackedState,
}

// === impl SpinMutexHandle ===

impl SpinMutexHandle<'_> {
    /// Acquires the mutex, spinning until it is available.
    pub fn lock(&mut self) {
        self.state.assert_may_lock();
        self.mutex.state.lock();
        self.state.set(HandleState::LockedUnique);
    }

    /// Releases the mutex.
    ///
    /// Calling this on a handle that does not hold the mutex is a contract
    /// violation: debug builds panic, release builds are undefined.
    pub fn unlock(&mut self) {
        self.state.assert_is(HandleState::LockedUnique);
        // SAFETY: this handle acquired the lock in `lock` (asserted above
        // in debug builds; the caller's contract in release builds).
        unsafe { self.mutex.state.unlock() };
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

impl Lockable for SpinMutexHandle<'_> {
    fn lock(&mut self) {
        SpinMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        SpinMutexHandle::unlock(self)
    }
}

impl fmt::Debug for SpinMutexHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}

/// A mutex that elides its spinlock with hardware transactions.
///
/// Critical sections are first attempted inside a hardware transaction,
/// with the fallback [`Spinlock`] only read, never written (see the
/// [module docs](self#elision) for the full protocol). Each handle makes up
/// to `RETRY_LIMIT` transactional attempts per acquisition; a limit of 0
/// disables elision entirely.
///
/// On targets without a transaction facility every attempt reports a
/// non-restartable abort, so the mutex behaves exactly like a [`SpinMutex`]
/// (with one recorded abort per acquisition).
pub struct HtmSpinMutex<const RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT> {
    state: CachePadded<Spinlock>,
}

// === impl HtmSpinMutex ===

impl HtmSpinMutex {
    loom_const_fn! {
        /// Returns a new `HtmSpinMutex` with the default retry limit.
        #[must_use]
        pub fn new() -> Self {
            Self { state: CachePadded::new(Spinlock::new()) }
        }
    }
}

impl<const RETRY_LIMIT: usize> HtmSpinMutex<RETRY_LIMIT> {
    loom_const_fn! {
        /// Returns a new mutex whose per-acquisition transactional attempt
        /// budget is the `RETRY_LIMIT` type parameter:
        ///
        /// ```
        /// use elision::HtmSpinMutex;
        ///
        /// // falls back to the spinlock after a single abort
        /// let mutex = HtmSpinMutex::<1>::with_retry_limit();
        /// # drop(mutex);
        /// ```
        #[must_use]
        pub fn with_retry_limit() -> Self {
            Self { state: CachePadded::new(Spinlock::new()) }
        }
    }

    /// Binds a new handle to this mutex.
    #[must_use]
    pub fn handle(&self) -> HtmSpinMutexHandle<'_, RETRY_LIMIT> {
        HtmSpinMutexHandle {
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
    ) -> HtmSpinMutexHandle<'a, RETRY_LIMIT> {
        HtmSpinMutexHandle {
            mutex: self,
            profile: Some(profile),
            state: HandleState::Unknown,
        }
    }

    /// Returns `true` if the fallback lock was held at the moment of the
    /// load. Elided critical sections do not hold it.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl<const RETRY_LIMIT: usize> Default for HtmSpinMutex<RETRY_LIMIT> {
    fn default() -> Self {
        Self::with_retry_limit()
    }
}

impl<const RETRY_LIMIT: usize> fmt::Debug for HtmSpinMutex<RETRY_LIMIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmSpinMutex")
            .field("locked", &self.is_locked())
            .field("retry_limit", &RETRY_LIMIT)
            .finish()
    }
}

/// A per-thread handle to an [`HtmSpinMutex`].
///
/// Unlike the plain flavors, this handle tracks its [`HandleState`] in
/// every build: `unlock` must know whether to commit a transaction or
/// release the fallback lock.
pub struct HtmSpinMutexHandle<'a, const RETRY_LIMIT: usize = DEFAULT_RETRY_LIMIT> {
    mutex: &'a HtmSpinMutex<RETRY_LIMIT>,
    profile: Option<&'a mut HtmProfile>,
    state: HandleState,
}

// === impl HtmSpinMutexHandle ===

impl<const RETRY_LIMIT: usize> HtmSpinMutexHandle<'_, RETRY_LIMIT> {
    /// Acquires the mutex: transactionally if possible, by taking the
    /// fallback spinlock otherwise.
    pub fn lock(&mut self) {
        debug_assert!(
            matches!(self.state, HandleState::Unknown | HandleState::Unlocked),
            "locked a handle that is already {:?}",
            self.state
        );
        let mut attempts = 0;
        while attempts < RETRY_LIMIT {
            // Never start a transaction while the fallback is held: it
            // would abort the moment we subscribe to the lock word, and
            // burn an attempt doing so.
            self.mutex.state.unlock_wait();
            let status = htm::begin();
            if status.is_started() {
                // Read the fallback lock into the transaction's read-set.
                // From here on, any thread acquiring it aborts us.
                if self.mutex.state.is_locked() {
                    // A holder slipped in between `unlock_wait` and the
                    // transaction start; returning now would race with it.
                    user_abort!(crate::htm::LOCK_HELD);
                }
                self.state = HandleState::Elided;
                return;
            }
            attempts += 1;
            test_debug!(?status, attempts, "transaction aborted");
            if let Some(p) = self.profile.as_deref_mut() {
                p.note_abort(status);
            }
            if !status.is_restartable() {
                break;
            }
        }
        trace!(attempts, "elision failed; acquiring the fallback lock");
        self.mutex.state.lock();
        self.state = HandleState::LockedUnique;
    }

    /// Releases the mutex: commits the transaction if this section was
    /// elided, releases the fallback spinlock if it was not.
    ///
    /// Calling this on a handle that does not hold the mutex is a contract
    /// violation: debug builds panic, release builds are undefined.
    pub fn unlock(&mut self) {
        match self.state {
            HandleState::Elided => {
                htm::commit();
                if let Some(p) = self.profile.as_deref_mut() {
                    // only the outermost commit publishes the section
                    if !htm::in_transaction() {
                        p.note_commit();
                    }
                }
            }
            HandleState::LockedUnique => {
                // SAFETY: this handle acquired the fallback lock in `lock`.
                unsafe { self.mutex.state.unlock() };
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

impl<const RETRY_LIMIT: usize> Lockable for HtmSpinMutexHandle<'_, RETRY_LIMIT> {
    fn lock(&mut self) {
        HtmSpinMutexHandle::lock(self)
    }

    fn unlock(&mut self) {
        HtmSpinMutexHandle::unlock(self)
    }
}

impl<const RETRY_LIMIT: usize> fmt::Debug for HtmSpinMutexHandle<'_, RETRY_LIMIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmSpinMutexHandle")
            .field("mutex", &self.mutex)
            .field("state", &self.state)
            .finish()
    }
}
