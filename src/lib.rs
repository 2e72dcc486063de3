#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, loom)), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub mod util;

pub mod htm;
pub mod lock;
pub mod mutex;
pub mod profile;
pub mod shared;
pub mod spin;

#[doc(inline)]
pub use self::lock::{Lockable, SharedLock, SharedLockable, UniqueLock};
#[doc(inline)]
pub use self::mutex::{
    HandleState, HtmSpinMutex, HtmSpinMutexHandle, NullMutex, NullMutexHandle, SpinMutex,
    SpinMutexHandle,
};
#[doc(inline)]
pub use self::profile::{HtmProfile, LockProfile, NullProfile, Profile};
#[doc(inline)]
pub use self::shared::{
    HtmSpinSharedMutex, HtmSpinSharedMutexHandle, NullSharedMutex, NullSharedMutexHandle,
    SpinSharedMutex, SpinSharedMutexHandle,
};
