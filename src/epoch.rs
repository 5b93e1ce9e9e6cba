/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! DEBRA: distributed epoch-based reclamation.
//!
//! Grounded on `examples/skytable-skytable/server/src/engine/idx/mtchm/mod.rs`,
//! which already builds a lock-free data structure directly on
//! `crossbeam_epoch::{Atomic, Guard, Owned, Shared}` and retires garbage with
//! `Guard::defer_destroy`. `crossbeam-epoch`'s global-epoch-plus-quiescence
//! scheme *is* a DEBRA-family reclaimer, so this module is a thin, per-`Dict`
//! instance wrapper that exposes `enter_quiescent`/`leave_quiescent`/
//! `retire`/`should_help` rather than leaking `crossbeam_epoch` types
//! directly — the LLX/SCX layer needs `retire` to additionally interact
//! with the SCX-descriptor reuse protocol of §4.3, which is a concern
//! `crossbeam-epoch` alone doesn't know about. On Unix targets it also
//! implements spec §6's `suspected_crash_signal` hook via
//! `install_crash_signal`/`crash_recovery_handler`.

use crossbeam_epoch::{Collector, Guard, LocalHandle, Shared};
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(unix)]
thread_local! {
    /// Set by [`EpochDomain::install_crash_signal`] for the calling thread:
    /// `(domain, tid)` so the process-wide signal handler below knows which
    /// slot of which domain to force quiescent. `domain` is a raw pointer
    /// because a signal handler is a plain `extern "C" fn`, not a closure —
    /// it cannot capture `&EpochDomain` directly.
    static CRASH_RECOVERY_TARGET: Cell<(*const (), usize)> = Cell::new((std::ptr::null(), 0));
}

/// Installed by [`EpochDomain::install_crash_signal`] via `libc::signal`.
/// Grounded on `original_source/cpp/weak_descriptors/main.cpp`'s
/// `sighandler`/`signal(SIGUSR1, sighandler)` registration, adapted from
/// "log and request whole-process shutdown" to "tell DEBRA this thread
/// will not call `enter_quiescent` again for a while." The handler does
/// not terminate the thread or loop: it returns normally, exactly like the
/// original's non-fatal `SIGUSR1` branch, and whatever code the thread was
/// running resumes right after the point it was interrupted.
#[cfg(unix)]
extern "C" fn crash_recovery_handler(_signum: i32) {
    CRASH_RECOVERY_TARGET.with(|cell| {
        let (domain, tid) = cell.get();
        if !domain.is_null() {
            unsafe { (*(domain as *const EpochDomain)).force_quiescent(tid) };
        }
    });
}

/// Per-thread epoch slot. Only ever touched by the one OS thread that owns
/// `tid` between `init_thread`/`deinit_thread` (the same single-owner
/// contract the original's per-tid arrays rely on:
/// `weak_descriptors/bst/bst.h`'s `allocatedNodes[tid*...]`), so plain
/// `UnsafeCell` + a manual `Sync` impl is sound here.
struct ThreadSlot {
    handle: UnsafeCell<Option<LocalHandle>>,
    guard: UnsafeCell<Option<Guard>>,
    active: AtomicU32,
}

// SAFETY: see struct doc - single-writer-at-a-time per slot by contract.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    fn empty() -> Self {
        Self {
            handle: UnsafeCell::new(None),
            guard: UnsafeCell::new(None),
            active: AtomicU32::new(0),
        }
    }
}

/// One epoch-reclamation domain per [`crate::Dict`] instance (so that
/// independent dictionaries, e.g. in tests, don't share quiescence state).
pub struct EpochDomain {
    collector: Collector,
    slots: Box<[ThreadSlot]>,
    help_counter: AtomicU32,
}

impl EpochDomain {
    pub fn new(num_threads: usize) -> Self {
        let mut slots = Vec::with_capacity(num_threads);
        slots.resize_with(num_threads, ThreadSlot::empty);
        Self {
            collector: Collector::new(),
            slots: slots.into_boxed_slice(),
            help_counter: AtomicU32::new(0),
        }
    }

    /// Must be called once by each thread before it calls any other method
    /// with this `tid`.
    pub fn init_thread(&self, tid: usize) {
        let slot = &self.slots[tid];
        let handle = self.collector.register();
        unsafe {
            *slot.handle.get() = Some(handle);
        }
    }

    pub fn deinit_thread(&self, tid: usize) {
        let slot = &self.slots[tid];
        unsafe {
            *slot.guard.get() = None;
            *slot.handle.get() = None;
        }
    }

    /// Enter an active section: the thread may now hold pointers into the
    /// data structure. Frames the start of one logical operation.
    pub fn leave_quiescent(&self, tid: usize) {
        let slot = &self.slots[tid];
        unsafe {
            let handle = (*slot.handle.get())
                .as_ref()
                .expect("leave_quiescent called before init_thread");
            *slot.guard.get() = Some(handle.pin());
        }
        slot.active.store(1, Ordering::Release);
    }

    /// Declare that the calling thread holds no pointers into the data
    /// structure. Must be called between the end of one logical operation
    /// and the start of the next (or before blocking/yielding for a long
    /// time).
    pub fn enter_quiescent(&self, tid: usize) {
        let slot = &self.slots[tid];
        slot.active.store(0, Ordering::Release);
        unsafe {
            *slot.guard.get() = None;
        }
        if self.help_counter.fetch_add(1, Ordering::Relaxed) % 64 == 0 {
            log::trace!("epoch: advancing global epoch after quiescent checkpoint");
        }
    }

    /// Borrow the guard framing the thread's current active section.
    ///
    /// # Panics
    /// Panics if called while `tid` is quiescent (a logic error in the
    /// caller: all pointer-following must happen inside a
    /// `leave_quiescent`/`enter_quiescent` frame).
    pub fn guard(&self, tid: usize) -> &Guard {
        let slot = &self.slots[tid];
        unsafe {
            (*slot.guard.get())
                .as_ref()
                .expect("dereference attempted while thread is quiescent")
        }
    }

    /// Retire `obj`: it is unreachable from the data structure as of this
    /// call (the caller already performed the pointer swing that drops the
    /// last reference) and will be freed once every thread has passed a
    /// quiescent point after the current epoch.
    ///
    /// # Safety
    /// `obj` must truly be unreachable and must not be retired twice.
    pub unsafe fn retire<T: 'static + Send>(&self, tid: usize, obj: Shared<'_, T>) {
        self.guard(tid).defer_destroy(obj);
    }

    /// Advisory: whether this thread should pause to help reclamation make
    /// progress (driven by how often quiescent checkpoints have occurred
    /// recently). Never required for correctness.
    pub fn should_help(&self) -> bool {
        self.help_counter.load(Ordering::Relaxed) % 256 == 0
    }

    /// Force `tid`'s slot to quiescent: drop its pinned [`Guard`], exactly
    /// like a self-called `enter_quiescent`, so the global epoch this
    /// thread was pinned at is free to advance and other threads' `retire`
    /// stops waiting on it. Only ever called from [`crash_recovery_handler`]
    /// on `tid`'s own thread, interrupted by `suspected_crash_signal` — so
    /// this races with nothing (the interrupted code and the handler run on
    /// the same OS thread, never concurrently), but it does mean `tid`'s
    /// normal control flow resumes right after without a live pin. This
    /// hook is meant for fault-injection tests where the "killed" thread
    /// does no further pointer-following after being signalled; a thread
    /// that keeps dereferencing pointers obtained before the signal would
    /// be relying on a grace period `crossbeam-epoch` no longer guarantees
    /// it for.
    #[cfg(unix)]
    fn force_quiescent(&self, tid: usize) {
        let slot = &self.slots[tid];
        slot.active.store(0, Ordering::Release);
        unsafe {
            *slot.guard.get() = None;
        }
    }

    /// Register `signal` (spec §6's `suspected_crash_signal`) as the signal
    /// that tells this domain "`tid` may not call `enter_quiescent` again
    /// for a while" (spec.md: "signal number DEBRA uses to interrupt a
    /// stalled thread"). Call once per thread, any time after
    /// `init_thread`. Must be called by the same OS thread that owns `tid`,
    /// since `libc::signal`'s handler runs on whichever thread receives the
    /// signal and identifies its target slot through this thread's own
    /// thread-local.
    #[cfg(unix)]
    pub fn install_crash_signal(&self, tid: usize, signal: i32) {
        CRASH_RECOVERY_TARGET.with(|cell| {
            cell.set((self as *const EpochDomain as *const (), tid));
        });
        unsafe {
            libc::signal(signal, crash_recovery_handler as libc::sighandler_t);
        }
    }

    /// No-op on non-Unix targets: `suspected_crash_signal` has no portable
    /// signal API to hook there, so the config value is accepted but has
    /// no effect (normal operation is unaffected either way — helping and
    /// epoch advancement don't depend on this hook for correctness, only
    /// for not stalling reclamation behind a thread that will never call
    /// `enter_quiescent` again).
    #[cfg(not(unix))]
    pub fn install_crash_signal(&self, _tid: usize, _signal: i32) {}
}
