/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! Three-path update driver: fast (pure HTM), middle (HTM wrapping
//! LLX/SCX), fallback (plain LLX/SCX, always correct, lock-free).
//!
//! Grounded on `examples/original_source/cpp/3path_htm/abtree/abtree_impl.h`,
//! whose `updateInsert_fast`/`_middle`/`_llx_scx` method triples this
//! module's `Driver::run` generalizes into one path-agnostic harness (tree
//! variants supply the three closures; `Driver` only owns path selection,
//! retry counting and the TLE lock). HTM access is through the stable
//! `core::arch::x86_64::{_xbegin, _xend, _xabort}` intrinsics, gated at
//! runtime by `is_x86_feature_detected!("rtm")` — per spec §9's note that
//! the C implementation's HTM usage is specified only by its observable
//! semantics, not by the specific intrinsics, this module is free to fall
//! straight through to `middle`/`fallback` on non-x86_64 targets or CPUs
//! without RTM.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single global transactional-lock-elision word: the fast path's HTM
/// transaction reads it (so a thread holding it non-transactionally
/// aborts any in-flight fast-path transaction, per the standard TLE
/// contract), and the fallback path takes it as a plain mutex only when it
/// needs to force out any concurrently-running fast-path transactions
/// (e.g. never, in our design — fallback never blocks; see
/// `DESIGN.md`). Grounded on `bst.h`'s `volatile int lock`, reused here as
/// `parking_lot::Mutex<()>` (already a teacher dependency).
struct TleLock(Mutex<()>);

pub struct Driver {
    tle: TleLock,
    /// Number of threads currently executing (or about to execute) the
    /// fallback path. The fast path self-aborts whenever this is nonzero
    /// (spec §4.4: "fast path must not run concurrently with fallback").
    num_fallback: AtomicUsize,
    rtm_available: bool,
    max_fast_retries: u32,
    max_slow_retries: u32,
}

/// Why a transactional attempt didn't commit. Carries the same
/// information `_xbegin`'s status word does, expressed as an explicit
/// tagged result instead of C's implicit retry-via-longjmp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAbort {
    /// The CPU doesn't support RTM, or the build is not x86_64.
    Unsupported,
    /// A conflicting access, capacity overflow, or nested abort.
    Hardware,
    /// `_xabort` was issued explicitly by our own code (e.g. the fast path
    /// detected `num_fallback != 0` and bailed out cooperatively).
    Explicit(u8),
    /// Retries exhausted for this path.
    RetriesExhausted,
}

pub type TxResult<T> = Result<T, TxAbort>;

impl Driver {
    pub fn new(max_fast_retries: u32, max_slow_retries: u32) -> Self {
        let rtm_available = detect_rtm();
        if !rtm_available {
            log::debug!("driver: RTM not available on this CPU/target, HTM paths disabled");
        }
        Self {
            tle: TleLock(Mutex::new(())),
            num_fallback: AtomicUsize::new(0),
            rtm_available,
            max_fast_retries,
            max_slow_retries,
        }
    }

    pub fn rtm_available(&self) -> bool {
        self.rtm_available
    }

    /// Run one logical update through up to three paths. `fast`/`middle`
    /// are retried internally up to their configured retry budgets before
    /// falling through; `fallback` is called at most once and must always
    /// make progress (it is the lock-free path of last resort).
    pub fn run<T>(
        &self,
        mut fast: impl FnMut() -> TxResult<T>,
        mut middle: impl FnMut() -> TxResult<T>,
        mut fallback: impl FnMut() -> T,
    ) -> T {
        if self.rtm_available && self.num_fallback.load(Ordering::Relaxed) == 0 {
            for _ in 0..self.max_fast_retries {
                match fast() {
                    Ok(v) => return v,
                    Err(TxAbort::Unsupported) => break,
                    Err(_) => continue,
                }
            }
            log::trace!("driver: fast path exhausted, falling through to middle");
        }

        if self.rtm_available {
            for _ in 0..self.max_slow_retries {
                match middle() {
                    Ok(v) => return v,
                    Err(TxAbort::Unsupported) => break,
                    Err(_) => continue,
                }
            }
            log::debug!("driver: middle path exhausted, falling through to fallback");
        }

        self.num_fallback.fetch_add(1, Ordering::AcqRel);
        let result = fallback();
        self.num_fallback.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Guard taken by the fallback path around any section it needs to run
    /// with fast-path transactions guaranteed aborted (none currently in
    /// this crate's update paths, but exposed for tree-level code that
    /// needs the stronger exclusion, e.g. range_query's fallback
    /// validation pass).
    pub fn exclude_fast(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.tle.0.lock()
    }
}

fn detect_rtm() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("rtm")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Begin a hardware transaction. On success the caller's subsequent
/// in-transaction writes are speculative until [`xend`] commits them.
///
/// # Safety
/// The caller must ensure every code path between `xbegin` and a matching
/// `xend`/abort is free of syscalls, I/O, or anything else that cannot be
/// rolled back; a transaction that aborts mid-way leaves no observable
/// side effect other than the control flow returning through this
/// function's `Err`.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rtm")]
pub unsafe fn xbegin() -> TxResult<()> {
    use std::arch::x86_64::{_xbegin, _XABORT_EXPLICIT};
    let status = _xbegin();
    if status == u32::MAX {
        Ok(())
    } else if status & _XABORT_EXPLICIT != 0 {
        let code = ((status >> 24) & 0xff) as u8;
        Err(TxAbort::Explicit(code))
    } else {
        Err(TxAbort::Hardware)
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rtm")]
pub unsafe fn xend() {
    std::arch::x86_64::_xend();
}

/// Self-abort the current transaction with an explicit 8-bit code (used by
/// the fast path's `num_fallback != 0` cooperative bail-out).
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rtm")]
pub unsafe fn xabort(code: u32) -> ! {
    std::arch::x86_64::_xabort(code);
    unreachable!("_xabort never returns")
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn xbegin() -> TxResult<()> {
    Err(TxAbort::Unsupported)
}
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn xend() {}
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn xabort(_code: u32) -> ! {
    unreachable!("xabort called without HTM support")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_runs_when_htm_unavailable() {
        let d = Driver {
            tle: TleLock(Mutex::new(())),
            num_fallback: AtomicUsize::new(0),
            rtm_available: false,
            max_fast_retries: 5,
            max_slow_retries: 5,
        };
        let out = d.run(
            || -> TxResult<i32> { panic!("fast must not run without RTM") },
            || -> TxResult<i32> { panic!("middle must not run without RTM") },
            || 42,
        );
        assert_eq!(out, 42);
    }

    #[test]
    fn fast_path_result_short_circuits() {
        let d = Driver::new(4, 4);
        if !d.rtm_available() {
            return;
        }
        let out = d.run(|| Ok::<_, TxAbort>(7), || panic!("middle should not run"), || panic!("fallback should not run"));
        assert_eq!(out, 7);
    }
}
