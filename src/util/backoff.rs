/// An [exponential backoff] for spin loops.
///
/// Waiting threads issue `2^exp` spin-loop hints per failed attempt, with
/// `exp` growing up to [`Self::MAX_EXPONENT`], so that a briefly-held lock
/// is observed quickly while a long wait keeps the contended cache line
/// quiet.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The maximum exponent: a single call to [`spin`](Self::spin) never
    /// issues more than `2^MAX_EXPONENT` spin-loop hints.
    pub const MAX_EXPONENT: u8 = 8;

    /// Returns a new exponential backoff.
    #[must_use]
    pub const fn new() -> Self {
        Self { exp: 0 }
    }

    /// Backs off in a spin loop.
    ///
    /// Each call issues `2^exp` [spin-loop hints], where `exp` starts at 0
    /// and increments with each call up to [`Self::MAX_EXPONENT`].
    ///
    /// [spin-loop hints]: core::hint::spin_loop
    #[inline(always)]
    pub fn spin(&mut self) {
        #[cfg_attr(loom, allow(unused_variables))]
        let spins = 1 << self.exp;

        #[cfg(not(loom))]
        for _ in 0..spins {
            crate::loom::hint::spin_loop();
        }

        #[cfg(loom)]
        {
            test_debug!("would back off for {spins} spins");
            loom::thread::yield_now();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
