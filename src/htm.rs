//! Hardware transactional memory intrinsics.
//!
//! This module wraps the CPU's transactional-memory facility behind a small
//! platform-independent surface:
//!
//! - [`begin`] starts a transaction, or reports why the previous attempt
//!   aborted,
//! - [`commit`] atomically publishes a transaction's side effects,
//! - [`in_transaction`] tests whether the calling thread is currently
//!   executing transactionally,
//! - [`user_abort!`](crate::user_abort) aborts the current transaction with
//!   an 8-bit code that the matching [`begin`] hands back.
//!
//! Abort causes are reported as a [`Status`] bitset in one canonical layout
//! regardless of the underlying hardware. Two hardware backends exist:
//! Intel RTM (x86_64 built with the `rtm` target feature) and Arm TME
//! (aarch64 built with the `tme` target feature). Everywhere else — and in
//! all loom builds — a software stub stands in: [`begin`] always reports a
//! non-restartable [`UNKNOWN`](Status::UNKNOWN) abort, so code layered on
//! this module compiles on every target and simply never elides.
//!
//! There is no guarantee any particular transaction ever commits, even on
//! real hardware; every caller needs a tested non-transactional fallback
//! path.

use core::{fmt, ops};

/// The abort code used by the elided lock types when a transaction observes
/// its fallback lock held: the critical section cannot proceed
/// transactionally right now, but retrying once the lock is released is
/// worthwhile.
pub const LOCK_HELD: u8 = 0xff;

/// The result of a [`begin`] call: either the [`STARTED`](Self::STARTED)
/// sentinel, or a bitset describing the most recent abort.
///
/// At least one flag bit is set in every abort status; a status carrying no
/// information is reported as [`UNKNOWN`](Self::UNKNOWN). If
/// [`EXPLICIT`](Self::EXPLICIT) is set, the 8-bit code passed to
/// [`user_abort!`](crate::user_abort) is available via
/// [`abort_code`](Self::abort_code).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Status(u32);

// === impl Status ===

impl Status {
    /// The sentinel status: a transaction is now executing on this thread.
    ///
    /// No abort produces this value.
    pub const STARTED: Self = Self(0);

    const ABORT_CODE: u32 = 0x0000_00ff;

    /// The hardware suggests the transaction may succeed on retry.
    pub const RETRY: Self = Self(1 << 8);
    /// The transaction was aborted by [`user_abort!`](crate::user_abort).
    pub const EXPLICIT: Self = Self(1 << 9);
    /// A memory conflict with another agent.
    pub const CONFLICT: Self = Self(1 << 10);
    /// The transactional read- or write-set outgrew the hardware's capacity.
    pub const CAPACITY: Self = Self(1 << 11);
    /// The abort happened in a nested transaction.
    pub const NESTED: Self = Self(1 << 12);
    /// A debug exception (breakpoint or watchpoint) fired transactionally.
    pub const DEBUG: Self = Self(1 << 13);
    /// An interrupt arrived mid-transaction.
    pub const INTERRUPT: Self = Self(1 << 14);
    /// The transaction executed something transactions cannot.
    pub const ERROR: Self = Self(1 << 15);
    /// The hardware reported no cause at all.
    pub const UNKNOWN: Self = Self(1 << 16);

    /// Returns `true` if this status is the [`STARTED`](Self::STARTED)
    /// sentinel rather than an abort.
    #[inline]
    #[must_use]
    pub fn is_started(self) -> bool {
        self == Self::STARTED
    }

    /// Returns `true` if any of the flag bits in `flags` are set.
    #[must_use]
    pub fn contains(self, Self(flags): Self) -> bool {
        self.0 & flags != 0
    }

    /// Returns the 8-bit code of an [`EXPLICIT`](Self::EXPLICIT) abort.
    ///
    /// Zero when the abort was not explicit.
    #[must_use]
    pub fn abort_code(self) -> u8 {
        (self.0 & Self::ABORT_CODE) as u8
    }

    /// Returns `true` if retrying the transaction may be profitable.
    ///
    /// The set of restartable causes is platform-dependent: RTM treats
    /// explicit, retry-hinted, and conflict aborts as restartable; TME
    /// only the retry hint (which [`user_abort!`](crate::user_abort) sets
    /// there); the software stub nothing at all.
    #[must_use]
    pub fn is_restartable(self) -> bool {
        self.0 & backend::RESTART_MASK.0 != 0
    }

    /// Returns the union of the flags in `self` and `other`.
    ///
    /// A `const`-friendly version of the `|` operator.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `self` with the explicit abort code set to `code`.
    #[must_use]
    pub const fn with_code(self, code: u8) -> Self {
        Self(self.0 | code as u32)
    }
}

impl ops::BitOr for Status {
    type Output = Self;

    fn bitor(self, Self(rhs): Self) -> Self::Output {
        Self(self.0 | rhs)
    }
}

impl ops::BitAnd for Status {
    type Output = Self;

    fn bitand(self, Self(rhs): Self) -> Self::Output {
        Self(self.0 & rhs)
    }
}

impl ops::Not for Status {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_started() {
            return f.write_str("STARTED");
        }

        let mut has_flags = false;
        fmt_bits!(
            self, f, has_flags, RETRY, EXPLICIT, CONFLICT, CAPACITY, NESTED, DEBUG, INTERRUPT,
            ERROR, UNKNOWN
        );

        if !has_flags {
            f.debug_tuple("UnknownStatus")
                .field(&format_args!("{:#x}", self.0))
                .finish()?;
        }

        if self.abort_code() != 0 {
            write!(f, " (code {:#04x})", self.abort_code())?;
        }

        Ok(())
    }
}

/// Starts a transaction.
///
/// Returns [`Status::STARTED`] when a transaction is now executing on this
/// thread; all memory operations until the matching [`commit`] are then
/// speculative. When a transaction aborts, all of its side effects are
/// discarded and control returns *here*, with the abort cause as the return
/// value.
#[inline]
#[must_use]
pub fn begin() -> Status {
    backend::begin()
}

/// Commits the current transaction, atomically publishing all of its
/// speculative side effects.
///
/// Must only be called inside a live transaction. On the software stub this
/// panics, since no transaction can ever have started.
#[inline]
pub fn commit() {
    backend::commit()
}

/// Returns `true` if the calling thread is executing inside a transaction.
#[inline]
#[must_use]
pub fn in_transaction() -> bool {
    backend::in_transaction()
}

/// Returns `true` if this build has a hardware transaction backend.
#[inline]
#[must_use]
pub const fn supported() -> bool {
    backend::SUPPORTED
}

/// Aborts the current transaction, discarding all of its speculative side
/// effects.
///
/// `$code` must be a constant expression evaluating to an 8-bit code; it is
/// encoded as an instruction immediate and comes back in the
/// [`Status`](crate::htm::Status) that the matching
/// [`begin`](crate::htm::begin) returns, with the
/// [`EXPLICIT`](crate::htm::Status::EXPLICIT) flag set. On TME the
/// expansion also sets the hardware retry hint, so explicit aborts remain
/// restartable there.
///
/// Control never proceeds past this macro inside a transaction. Invoking it
/// with no transaction active panics.
#[macro_export]
macro_rules! user_abort {
    ($code:expr) => {{
        #[cfg(all(target_arch = "x86_64", target_feature = "rtm", not(loom)))]
        {
            // SAFETY: the `rtm` target feature is statically enabled.
            unsafe { ::core::arch::x86_64::_xabort($code as u32) };
        }
        #[cfg(all(target_arch = "aarch64", target_feature = "tme", not(loom)))]
        {
            // Bit 15 of the TCANCEL immediate is the retry hint.
            unsafe {
                ::core::arch::asm!(
                    "tcancel #{imm}",
                    imm = const (($code as u32) | (1 << 15)),
                    options(nostack),
                );
            }
        }
        #[cfg(any(
            loom,
            not(any(
                all(target_arch = "x86_64", target_feature = "rtm"),
                all(target_arch = "aarch64", target_feature = "tme"),
            ))
        ))]
        {
            let _ = $code;
        }
        ::core::unreachable!("user_abort with no transaction active")
    }};
}

#[cfg(all(target_arch = "x86_64", target_feature = "rtm", not(loom)))]
use self::rtm as backend;

#[cfg(all(target_arch = "aarch64", target_feature = "tme", not(loom)))]
use self::tme as backend;

#[cfg(any(
    loom,
    not(any(
        all(target_arch = "x86_64", target_feature = "rtm"),
        all(target_arch = "aarch64", target_feature = "tme"),
    ))
))]
use self::sw as backend;

/// Intel Restricted Transactional Memory.
#[cfg(all(target_arch = "x86_64", target_feature = "rtm", not(loom)))]
mod rtm {
    use super::Status;
    use core::arch::x86_64::{
        _xbegin, _xend, _xtest, _XABORT_CAPACITY, _XABORT_CONFLICT, _XABORT_DEBUG,
        _XABORT_EXPLICIT, _XABORT_NESTED, _XABORT_RETRY, _XBEGIN_STARTED,
    };

    pub(super) const SUPPORTED: bool = true;

    pub(super) const RESTART_MASK: Status = Status::EXPLICIT
        .union(Status::RETRY)
        .union(Status::CONFLICT);

    pub(super) fn begin() -> Status {
        // SAFETY: the `rtm` target feature is statically enabled.
        let raw = unsafe { _xbegin() };
        if raw == _XBEGIN_STARTED {
            return Status::STARTED;
        }
        translate(raw)
    }

    pub(super) fn commit() {
        // SAFETY: the `rtm` target feature is statically enabled; per this
        // module's contract, a transaction is live.
        unsafe { _xend() }
    }

    pub(super) fn in_transaction() -> bool {
        // SAFETY: the `rtm` target feature is statically enabled; `xtest`
        // is valid in any state.
        unsafe { _xtest() != 0 }
    }

    fn translate(raw: u32) -> Status {
        let mut status = Status(0);
        if raw & _XABORT_EXPLICIT != 0 {
            // the user code travels in bits 24..32 of the raw status
            status = status.union(Status::EXPLICIT).with_code((raw >> 24) as u8);
        }
        if raw & _XABORT_RETRY != 0 {
            status = status.union(Status::RETRY);
        }
        if raw & _XABORT_CONFLICT != 0 {
            status = status.union(Status::CONFLICT);
        }
        if raw & _XABORT_CAPACITY != 0 {
            status = status.union(Status::CAPACITY);
        }
        if raw & _XABORT_NESTED != 0 {
            status = status.union(Status::NESTED);
        }
        if raw & _XABORT_DEBUG != 0 {
            status = status.union(Status::DEBUG);
        }
        if status.0 == 0 {
            // aborted with no information at all (e.g. an interrupt)
            status = Status::UNKNOWN;
        }
        status
    }
}

/// Arm Transactional Memory Extension.
#[cfg(all(target_arch = "aarch64", target_feature = "tme", not(loom)))]
mod tme {
    use super::Status;
    use core::arch::asm;

    pub(super) const SUPPORTED: bool = true;

    pub(super) const RESTART_MASK: Status = Status::RETRY;

    // raw TSTART status bits
    const RAW_RETRY: u64 = 1 << 15;
    const RAW_EXPLICIT: u64 = 1 << 16;
    const RAW_CONFLICT: u64 = 1 << 17;
    const RAW_UNKNOWN: u64 = 1 << 18;
    const RAW_ERROR: u64 = 1 << 19;
    const RAW_CAPACITY: u64 = 1 << 20;
    const RAW_NESTED: u64 = 1 << 21;
    const RAW_DEBUG: u64 = 1 << 22;
    const RAW_INTERRUPT: u64 = 1 << 23;
    const RAW_CODE: u64 = 0x7fff;

    pub(super) fn begin() -> Status {
        let raw: u64;
        // SAFETY: TSTART is valid in any state; it either enters a
        // transaction (returning zero) or reports the last abort cause.
        unsafe { asm!("tstart {0}", out(reg) raw, options(nostack)) };
        if raw == 0 {
            return Status::STARTED;
        }
        translate(raw)
    }

    pub(super) fn commit() {
        // SAFETY: per this module's contract, a transaction is live.
        unsafe { asm!("tcommit", options(nostack)) }
    }

    pub(super) fn in_transaction() -> bool {
        let depth: u64;
        // SAFETY: TTEST is valid in any state; it reports transaction depth.
        unsafe { asm!("ttest {0}", out(reg) depth, options(nomem, nostack)) };
        depth != 0
    }

    fn translate(raw: u64) -> Status {
        let mut status = Status(0);
        if raw & RAW_EXPLICIT != 0 {
            status = status
                .union(Status::EXPLICIT)
                .with_code((raw & RAW_CODE) as u8);
        }
        if raw & RAW_RETRY != 0 {
            status = status.union(Status::RETRY);
        }
        if raw & RAW_CONFLICT != 0 {
            status = status.union(Status::CONFLICT);
        }
        if raw & RAW_CAPACITY != 0 {
            status = status.union(Status::CAPACITY);
        }
        if raw & RAW_NESTED != 0 {
            status = status.union(Status::NESTED);
        }
        if raw & RAW_DEBUG != 0 {
            status = status.union(Status::DEBUG);
        }
        if raw & RAW_INTERRUPT != 0 {
            status = status.union(Status::INTERRUPT);
        }
        if raw & RAW_ERROR != 0 {
            status = status.union(Status::ERROR);
        }
        if raw & RAW_UNKNOWN != 0 || status.0 == 0 {
            status = status.union(Status::UNKNOWN);
        }
        status
    }
}

/// Software stub for targets without a transaction facility (and for loom
/// builds, where elision is modeled as always falling back).
#[cfg(any(
    loom,
    not(any(
        all(target_arch = "x86_64", target_feature = "rtm"),
        all(target_arch = "aarch64", target_feature = "tme"),
    ))
))]
mod sw {
    use super::Status;

    pub(super) const SUPPORTED: bool = false;

    pub(super) const RESTART_MASK: Status = Status(0);

    pub(super) fn begin() -> Status {
        Status::UNKNOWN
    }

    pub(super) fn commit() {
        unreachable!("no transaction support on this target")
    }

    pub(super) fn in_transaction() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_is_distinct_from_aborts() {
        assert!(Status::STARTED.is_started());
        for flag in [
            Status::RETRY,
            Status::EXPLICIT,
            Status::CONFLICT,
            Status::CAPACITY,
            Status::NESTED,
            Status::DEBUG,
            Status::INTERRUPT,
            Status::ERROR,
            Status::UNKNOWN,
        ] {
            assert!(!flag.is_started());
            assert!(flag.contains(flag));
            assert!(!Status::STARTED.contains(flag));
        }
    }

    #[test]
    fn abort_codes() {
        let status = Status::EXPLICIT.with_code(LOCK_HELD);
        assert!(status.contains(Status::EXPLICIT));
        assert_eq!(status.abort_code(), LOCK_HELD);
        assert_eq!((Status::CONFLICT | Status::RETRY).abort_code(), 0);
    }

    #[test]
    fn bit_ops() {
        let status = Status::CONFLICT | Status::RETRY;
        assert!(status.contains(Status::CONFLICT));
        assert!(status.contains(Status::RETRY));
        assert!(!status.contains(Status::CAPACITY));
        assert!(!(status & Status::CAPACITY).contains(Status::CAPACITY));
        assert!((!Status::CONFLICT & status).contains(Status::RETRY));
    }

    #[test]
    fn debug_output() {
        assert_eq!(format!("{:?}", Status::STARTED), "STARTED");
        assert_eq!(
            format!("{:?}", Status::CONFLICT | Status::RETRY),
            "RETRY | CONFLICT"
        );
        assert_eq!(
            format!("{:?}", Status::EXPLICIT.with_code(0xff)),
            "EXPLICIT (code 0xff)"
        );
    }

    #[test]
    fn begin_either_starts_or_reports_an_abort() {
        crate::loom::model(|| {
            let status = begin();
            if status.is_started() {
                // don't do anything fancy transactionally; just commit
                commit();
            } else {
                assert!(!status.is_started());
                assert!(!in_transaction());
            }
        });
    }

    #[test]
    #[cfg(not(any(
        all(target_arch = "x86_64", target_feature = "rtm"),
        all(target_arch = "aarch64", target_feature = "tme"),
    )))]
    fn software_stub_never_starts() {
        crate::loom::model(|| {
            assert!(!supported());
            let status = begin();
            assert!(status.contains(Status::UNKNOWN));
            assert!(!status.is_restartable());
            assert!(!in_transaction());
        });
    }
}
