/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! Low-level synchronization helpers shared by every layer of the core:
//! exponential backoff for CAS-retry loops and helping protocols.

use std::{cell::Cell, hint::spin_loop, thread};

/// Exponential backoff, used by CAS-retry loops in [`crate::llx_scx`] and by
/// threads spinning while helping another thread's in-progress SCX.
pub struct Backoff {
    cur: Cell<u8>,
}

impl Backoff {
    const MAX_SPIN: u8 = 6;
    const MAX_YIELD: u8 = 8;

    pub fn new() -> Self {
        Self { cur: Cell::new(0) }
    }

    /// Spin a few times, giving way to the CPU, but yield to the OS scheduler
    /// once we've spun more than `MAX_SPIN` times.
    pub fn snooze(&self) {
        if self.cur.get() <= Self::MAX_SPIN {
            for _ in 0..1u32 << self.cur.get() {
                spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.cur.get() <= Self::MAX_YIELD {
            self.cur.set(self.cur.get() + 1);
        }
    }

    pub fn reset(&self) {
        self.cur.set(0);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
