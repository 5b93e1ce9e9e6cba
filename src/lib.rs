/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! Concurrent in-memory ordered dictionaries built on a shared LLX/SCX
//! core: an unbalanced BST, an (a,b)-tree, and a B-slack tree, all
//! supporting `insert`/`erase`/`find`/`range_query` under heavy
//! multi-threaded contention.
//!
//! The core is a tower of four layers (dependency order, leaves first):
//! [`epoch`] (DEBRA epoch-based reclamation) → [`descriptor`] (SCX
//! descriptor store) → [`llx_scx`] (the LLX/SCX primitive) → [`driver`]
//! (the three-path fast-HTM/middle-HTM/fallback update driver). The tree
//! modules ([`bst`], [`abtree`], [`bslack`]) are leaves that drive the
//! core through the [`Dict`] trait; their rebalancing shapes are the only
//! thing that differs between them.

pub mod abtree;
pub mod bslack;
pub mod bst;
pub mod descriptor;
pub mod driver;
pub mod epoch;
pub mod llx_scx;
pub mod sync;

use std::fmt;

/// The single error this crate's interface can surface (spec §7: "no
/// errors cross the dictionary interface except success-or-absence
/// semantics"). Resource exhaustion otherwise aborts the process via the
/// normal Rust allocator failure path rather than being represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictError {
    /// `Dict::new` was asked for more threads than the descriptor store
    /// can address, or a `tid` outside `[0, num_threads)` was used.
    ThreadIdOutOfRange,
}

impl fmt::Display for DictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DictError::ThreadIdOutOfRange => write!(f, "thread id out of range for this Dict's descriptor store"),
        }
    }
}

impl std::error::Error for DictError {}

/// Runtime-tunable driver knobs, fixed at construction (spec §6).
/// Compile-time tree tuning (branching factor, slack) lives on each tree's
/// own `Config` trait, in the teacher's `engine::idx::mtchm::meta::Config`
/// style, not here.
#[derive(Debug, Clone, Copy)]
pub struct DictConfig {
    /// `>= 0` enables the fast HTM path, with this many retries before
    /// falling through to middle/fallback. Negative disables it.
    pub max_fast_retries: i32,
    /// `>= 0` enables the middle HTM path (transactional LLX/SCX).
    /// Negative disables it.
    pub max_slow_retries: i32,
    /// B-slack only: trade average node degree for amortized
    /// rebalancing cost.
    pub allow_extra_slack: bool,
    /// Unix signal number DEBRA treats as "this thread may be stalled
    /// mid-operation": each thread's `Dict::init_thread` registers it via
    /// `epoch::EpochDomain::install_crash_signal`, so that when the signal
    /// arrives the interrupted thread's epoch slot is forced quiescent and
    /// other threads' reclamation stops waiting on it. `None` disables the
    /// hook. No-op on non-Unix targets.
    pub suspected_crash_signal: Option<i32>,
}

impl Default for DictConfig {
    fn default() -> Self {
        Self {
            max_fast_retries: 10,
            max_slow_retries: 10,
            allow_extra_slack: false,
            suspected_crash_signal: None,
        }
    }
}

impl DictConfig {
    /// Disable both HTM paths, forcing every operation through the
    /// non-transactional LLX/SCX fallback. Useful on CPUs without RTM and
    /// in tests that want deterministic single-path behavior.
    pub fn without_htm(mut self) -> Self {
        self.max_fast_retries = -1;
        self.max_slow_retries = -1;
        self
    }
}

/// The common surface implemented by [`bst::Bst`], [`abtree::Abtree`] and
/// [`bslack::Bslack`] (spec §6). Each method takes the calling thread's
/// `tid`, established by a prior [`Dict::init_thread`] call.
pub trait Dict<K, V> {
    fn init_thread(&self, tid: usize);
    fn deinit_thread(&self, tid: usize);
    fn find(&self, tid: usize, key: &K) -> Option<V>;
    fn insert(&self, tid: usize, key: K, value: V) -> Result<Option<V>, DictError>;
    fn insert_if_absent(&self, tid: usize, key: K, value: V) -> Result<bool, DictError>;
    fn erase(&self, tid: usize, key: &K) -> Result<Option<V>, DictError>;
    /// Writes up to `buffer.len()` key-value pairs in `[lo, hi]` into
    /// `buffer` and returns how many were written (spec §6's bounded,
    /// non-allocating `range_query(tid, lo, hi, buffer) -> count`).
    fn range_query(&self, tid: usize, lo: &K, hi: &K, buffer: &mut [(K, V)]) -> usize;
}

impl<K: Ord + Clone, V: Clone> Dict<K, V> for bst::Bst<K, V> {
    fn init_thread(&self, tid: usize) {
        bst::Bst::init_thread(self, tid)
    }
    fn deinit_thread(&self, tid: usize) {
        bst::Bst::deinit_thread(self, tid)
    }
    fn find(&self, tid: usize, key: &K) -> Option<V> {
        bst::Bst::find(self, tid, key)
    }
    fn insert(&self, tid: usize, key: K, value: V) -> Result<Option<V>, DictError> {
        bst::Bst::insert(self, tid, key, value)
    }
    fn insert_if_absent(&self, tid: usize, key: K, value: V) -> Result<bool, DictError> {
        bst::Bst::insert_if_absent(self, tid, key, value)
    }
    fn erase(&self, tid: usize, key: &K) -> Result<Option<V>, DictError> {
        bst::Bst::erase(self, tid, key)
    }
    fn range_query(&self, tid: usize, lo: &K, hi: &K, buffer: &mut [(K, V)]) -> usize {
        bst::Bst::range_query(self, tid, lo, hi, buffer)
    }
}
