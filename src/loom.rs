//! Abstraction layer over concurrency primitives: when `cfg(loom)` is
//! enabled, this module re-exports `loom`'s simulated atomics, cells, and
//! threads so the whole crate (and its tests) can be model-checked;
//! otherwise it re-exports the real thing.
#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) use loom::{cell, hint, model, thread};

    pub(crate) mod sync {
        pub(crate) use loom::sync::*;
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) mod sync {
        #[cfg(test)]
        pub(crate) use std::sync::Arc;

        pub(crate) mod atomic {
            pub(crate) use portable_atomic::*;
        }
    }

    pub(crate) use portable_atomic::hint;

    #[cfg(test)]
    pub(crate) use std::thread;

    /// Runs `f` directly; the loom version of this function explores every
    /// interleaving of `f` instead.
    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let _trace = crate::util::test::trace_init();
        f()
    }

    pub(crate) mod cell {
        /// Mirror of `loom::cell::UnsafeCell`, so code under test can use
        /// loom's checked cell API unchanged in ordinary builds.
        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub(crate) const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }

            #[must_use]
            pub(crate) fn into_inner(self) -> T {
                self.0.into_inner()
            }
        }

        impl<T: ?Sized> UnsafeCell<T> {
            #[inline(always)]
            pub(crate) fn with<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*const T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn with_mut<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*mut T) -> R,
            {
                f(self.0.get())
            }
        }
    }
}
