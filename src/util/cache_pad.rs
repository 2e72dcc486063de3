use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Aligns the wrapped value to the size of a cache line.
///
/// This is used to avoid [false sharing] between values that are accessed
/// concurrently: the lock word(s) of a mutex, and each thread's profile
/// counters.
///
/// The alignment depends on the target architecture: 128 bytes on
/// `x86_64`/`aarch64` (whose prefetchers pull cache lines in pairs), 64
/// bytes elsewhere.
///
/// [false sharing]: https://en.wikipedia.org/wiki/False_sharing
#[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    repr(align(64))
)]
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
pub struct CachePadded<T>(T);

// === impl CachePadded ===

impl<T> CachePadded<T> {
    /// Pads `value` to the length of a cache line.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Unwraps the inner value and returns it.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
