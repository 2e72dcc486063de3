//! Capability traits for mutex handles, and scoped locking on top of them.
//!
//! Every mutex flavor in this crate is operated through a per-thread
//! handle. The [`Lockable`] and [`SharedLockable`] traits describe what a
//! handle can do, so code can be generic over which flavor it is
//! synchronized by — including the null flavors, whose implementations do
//! nothing. [`UniqueLock`] and [`SharedLock`] acquire a handle for the
//! duration of a scope and release it on every exit path, including
//! unwinding.

use core::fmt;

/// A handle that can be locked for exclusive access.
pub trait Lockable {
    /// Acquires the lock exclusively, blocking until it is available.
    fn lock(&mut self);

    /// Releases the exclusive lock.
    ///
    /// Calling this on a handle that does not currently hold the lock
    /// exclusively is a contract violation: it panics in debug builds and
    /// is undefined in release builds.
    fn unlock(&mut self);
}

/// A handle that can additionally be locked for shared access.
pub trait SharedLockable: Lockable {
    /// Acquires the lock for shared access, blocking until no writer holds
    /// or awaits it.
    fn lock_shared(&mut self);

    /// Releases a shared hold on the lock.
    ///
    /// Calling this on a handle that does not currently hold the lock for
    /// shared access is a contract violation: it panics in debug builds
    /// and is undefined in release builds.
    fn unlock_shared(&mut self);
}

/// Exclusively locks a borrowed handle for the duration of a scope.
///
/// The lock is acquired by [`new`](Self::new) and released when the
/// `UniqueLock` is dropped, on every exit path.
///
/// # Examples
///
/// ```
/// use elision::{SpinMutex, UniqueLock};
///
/// let mutex = SpinMutex::new();
/// let mut handle = mutex.handle();
///
/// {
///     let _guard = UniqueLock::new(&mut handle);
///     // ...exclusive critical section...
/// }
/// // unlocked again here
/// ```
#[must_use = "if unused, the lock is released immediately"]
pub struct UniqueLock<'a, H: Lockable> {
    handle: &'a mut H,
}

/// Locks a borrowed handle for shared access for the duration of a scope.
///
/// The lock is acquired by [`new`](Self::new) and released when the
/// `SharedLock` is dropped, on every exit path.
#[must_use = "if unused, the lock is released immediately"]
pub struct SharedLock<'a, H: SharedLockable> {
    handle: &'a mut H,
}

// === impl UniqueLock ===

impl<'a, H: Lockable> UniqueLock<'a, H> {
    /// Acquires `handle` exclusively, releasing it again when the returned
    /// guard is dropped.
    pub fn new(handle: &'a mut H) -> Self {
        handle.lock();
        Self { handle }
    }
}

impl<H: Lockable> Drop for UniqueLock<'_, H> {
    fn drop(&mut self) {
        self.handle.unlock();
    }
}

impl<H: Lockable> fmt::Debug for UniqueLock<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueLock").finish_non_exhaustive()
    }
}

// === impl SharedLock ===

impl<'a, H: SharedLockable> SharedLock<'a, H> {
    /// Acquires `handle` for shared access, releasing it again when the
    /// returned guard is dropped.
    pub fn new(handle: &'a mut H) -> Self {
        handle.lock_shared();
        Self { handle }
    }
}

impl<H: SharedLockable> Drop for SharedLock<'_, H> {
    fn drop(&mut self) {
        self.handle.unlock_shared();
    }
}

impl<H: SharedLockable> fmt::Debug for SharedLock<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mutex::SpinMutex, shared::SpinSharedMutex};

    #[test]
    fn unique_lock_releases_on_drop() {
        crate::loom::model(|| {
            let mutex = SpinMutex::new();
            let mut handle = mutex.handle();

            {
                let _guard = UniqueLock::new(&mut handle);
                assert!(mutex.is_locked());
            }
            assert!(!mutex.is_locked());
        });
    }

    #[test]
    fn shared_lock_releases_on_drop() {
        crate::loom::model(|| {
            let mutex = SpinSharedMutex::new();
            let mut handle = mutex.handle();

            {
                let _guard = SharedLock::new(&mut handle);
                assert!(mutex.is_locked());
            }
            assert!(!mutex.is_locked());

            {
                let _guard = UniqueLock::new(&mut handle);
                assert!(mutex.is_locked());
            }
            assert!(!mutex.is_locked());
        });
    }

    #[test]
    #[cfg(not(loom))]
    fn unique_lock_releases_on_unwind() {
        let _trace = crate::util::test::trace_init();
        let mutex = SpinMutex::new();
        let mut handle = mutex.handle();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = UniqueLock::new(&mut handle);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!mutex.is_locked());

        // the handle is usable again after the unwind
        handle.lock();
        handle.unlock();
    }
}
