//! Shared utilities for the lock implementations.
//!
//! This module exposes two helpers that are useful beyond this crate:
//!
//! - [`Backoff`]: exponential backoff for spin loops
//! - [`CachePadded`]: pads and aligns a value to the size of a cache line

#[cfg(any(test, feature = "tracing"))]
macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing")))]
macro_rules! trace {
    ($($t:tt)*) => {};
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_debug {
    ($($t:tt)*) => { tracing::debug!($($t)*) }
}

#[cfg(not(test))]
macro_rules! test_debug {
    ($($t:tt)*) => {};
}

macro_rules! fmt_bits {
    ($self: expr, $f: expr, $has_states: ident, $($name: ident),+) => {
        $(
            if $self.contains(Self::$name) {
                if $has_states {
                    $f.write_str(" | ")?;
                }
                $f.write_str(stringify!($name))?;
                $has_states = true;
            }
        )+

    };
}

macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis unsafe fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const unsafe fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis unsafe fn $name($($arg: $T),*) -> $Ret $body
    };
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}

/// Indicates unreachable code that we are confident is *truly* unreachable.
///
/// In debug mode builds and in tests, this expands to `unreachable!()`,
/// causing a panic. In release mode non-test builds, this expands to
/// `core::hint::unreachable_unchecked`. Lock handles use it for states the
/// handle state machine cannot reach unless the caller has already broken
/// the locking contract.
macro_rules! unreachable_unchecked {
    ($($arg:tt)*) => ({
        #[cfg(any(test, debug_assertions))]
        panic!($($arg)*);
        #[allow(unreachable_code)]
        {
            // SAFETY: reaching this point requires a prior contract
            // violation (e.g. an unlock with no matching lock), which the
            // debug build would have caught as a panic above.
            unsafe { core::hint::unreachable_unchecked() }
        }
    });
}

mod backoff;
mod cache_pad;

pub use self::{backoff::Backoff, cache_pad::CachePadded};

#[cfg(test)]
pub(crate) mod test {
    /// Initialize tracing with a default filter directive.
    ///
    /// Returns a guard that must be held for the duration of the test to
    /// ensure tracing messages are actually output.
    #[cfg(not(loom))]
    #[must_use]
    pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::{
            filter::{EnvFilter, LevelFilter},
            util::SubscriberInitExt,
        };

        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
        let filter = if env.is_empty() {
            builder.parse_lossy("elision=info")
        } else {
            builder.parse_lossy(env)
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .finish()
            .set_default()
    }

    #[allow(dead_code)]
    pub(crate) fn assert_send<T: Send>() {}

    #[allow(dead_code)]
    pub(crate) fn assert_send_sync<T: Send + Sync>() {}
}
