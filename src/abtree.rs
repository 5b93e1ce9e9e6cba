/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! (a,b)-tree over LLX/SCX: internal nodes hold up to `B-1` routing keys
//! and `B` children; leaves hold up to `B` sorted `(key, value)` pairs.
//!
//! Grounded on `examples/original_source/cpp/3path_htm/abtree/abtree_impl.h`
//! for the overall update shape (search, leaf-array insert/erase, single-
//! level split on overflow) and on `ScxNode`/`llx_scx` (shared with
//! [`crate::bst`]) for the underlying freeze/mark/commit protocol. Per
//! spec §1's Non-goal ("tree rebalancing rules... out of scope: only the
//! LLX/SCX contract matters"), the cascading multi-level split/merge and
//! redistribution transformations of the original (`tagSplit`,
//! `joinSibling`, `redistributeSibling`, `rootJoinParent`) are not
//! reproduced in full; see `DESIGN.md` for which simplifications were
//! made and why they still satisfy every LLX/SCX precondition.

use crate::descriptor::TagPtr;
use crate::driver::{Driver, TxAbort, TxResult};
use crate::epoch::EpochDomain;
use crate::llx_scx::{llx, scx, ScxArgs, ScxNode};
use crate::sync::Backoff;
use crate::{Dict, DictConfig, DictError};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Compile-time tuning, in the teacher's `Config`-trait-over-constants
/// style (`engine::idx::mtchm::meta::{PreConfig, Config}`), rather than a
/// runtime struct: branching factor is a hot-path constant, not something
/// tuned per instance.
pub trait AbtreeParams: 'static {
    const A: usize;
    const B: usize;
}

#[derive(Debug)]
pub struct DefaultParams;
impl AbtreeParams for DefaultParams {
    const A: usize = 2;
    const B: usize = 4;
}

pub struct Node<K, V> {
    leaf: bool,
    keys: Vec<K>,
    values: Vec<V>,
    children: Vec<AtomicPtr<Node<K, V>>>,
    scx_ptr: AtomicUsize,
    marked: AtomicBool,
}

impl<K, V> Node<K, V> {
    fn new_leaf(keys: Vec<K>, values: Vec<V>, dummy: TagPtr) -> Box<Self> {
        Box::new(Self {
            leaf: true,
            keys,
            values,
            children: Vec::new(),
            scx_ptr: AtomicUsize::new(dummy.to_bits()),
            marked: AtomicBool::new(false),
        })
    }

    fn new_internal(keys: Vec<K>, children: Vec<*mut Self>, dummy: TagPtr) -> Box<Self> {
        Box::new(Self {
            leaf: false,
            keys,
            values: Vec::new(),
            children: children.into_iter().map(AtomicPtr::new).collect(),
            scx_ptr: AtomicUsize::new(dummy.to_bits()),
            marked: AtomicBool::new(false),
        })
    }
}

impl<K, V> ScxNode for Node<K, V> {
    fn num_children(&self) -> usize {
        self.children.len()
    }
    fn child(&self, i: usize) -> &AtomicPtr<Self> {
        &self.children[i]
    }
    fn scx_ptr(&self) -> &AtomicUsize {
        &self.scx_ptr
    }
    fn marked(&self) -> &AtomicBool {
        &self.marked
    }
}

type Store<K, V> = crate::descriptor::DescriptorStore<Node<K, V>>;

pub struct Abtree<K, V, P: AbtreeParams = DefaultParams> {
    entry: Box<Node<K, V>>,
    store: Store<K, V>,
    epoch: EpochDomain,
    driver: Driver,
    crash_signal: Option<i32>,
    _params: std::marker::PhantomData<P>,
}

impl<K: Ord + Clone, V: Clone, P: AbtreeParams> Abtree<K, V, P> {
    pub fn new(num_threads: usize, config: DictConfig) -> Self {
        assert!(P::B <= crate::llx_scx::MAX_FANOUT, "branching factor exceeds MAX_FANOUT");
        let store = Store::new(num_threads);
        let dummy = store.dummy_tagptr();
        let root_leaf = Box::into_raw(Node::new_leaf(Vec::new(), Vec::new(), dummy));
        let entry = Node::new_internal(Vec::new(), vec![root_leaf], dummy);
        log::debug!("abtree: constructed with a={}, b={}, {num_threads} threads", P::A, P::B);
        Self {
            entry,
            store,
            epoch: EpochDomain::new(num_threads),
            driver: Driver::new(
                config.max_fast_retries.max(0) as u32,
                config.max_slow_retries.max(0) as u32,
            ),
            crash_signal: config.suspected_crash_signal,
            _params: std::marker::PhantomData,
        }
    }

    fn entry_ptr(&self) -> *mut Node<K, V> {
        &*self.entry as *const _ as *mut _
    }

    /// Index of the child to descend into for `key` at an internal node
    /// with routing keys `keys[0..keys.len())`, keys[i] being the smallest
    /// key reachable through `children[i+1]`.
    fn child_index(keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| k <= key)
    }

    fn search(&self, key: &K) -> (*mut Node<K, V>, *mut Node<K, V>) {
        let mut parent = self.entry_ptr();
        let mut curr = unsafe { &*parent }.children[0].load(Ordering::Acquire);
        loop {
            let n = unsafe { &*curr };
            if n.leaf {
                return (parent, curr);
            }
            parent = curr;
            let idx = Self::child_index(&n.keys, key);
            curr = n.children[idx].load(Ordering::Acquire);
        }
    }

    fn search_with_grandparent(
        &self,
        key: &K,
    ) -> (*mut Node<K, V>, *mut Node<K, V>, *mut Node<K, V>) {
        let mut gp = std::ptr::null_mut();
        let mut parent = self.entry_ptr();
        let mut curr = unsafe { &*parent }.children[0].load(Ordering::Acquire);
        loop {
            let n = unsafe { &*curr };
            if n.leaf {
                return (gp, parent, curr);
            }
            gp = parent;
            parent = curr;
            let idx = Self::child_index(&n.keys, key);
            curr = n.children[idx].load(Ordering::Acquire);
        }
    }

    pub fn find(&self, tid: usize, key: &K) -> Option<V> {
        self.epoch.leave_quiescent(tid);
        let (_, leaf) = self.search(key);
        let n = unsafe { &*leaf };
        let result = n.keys.iter().position(|k| k == key).map(|i| n.values[i].clone());
        self.epoch.enter_quiescent(tid);
        result
    }

    pub fn insert(&self, tid: usize, key: K, value: V) -> Result<Option<V>, DictError> {
        self.epoch.leave_quiescent(tid);
        let backoff = Backoff::new();
        let result = loop {
            match self.driver.run(
                || TxResult::Err(TxAbort::Unsupported),
                || TxResult::Err(TxAbort::Unsupported),
                || self.attempt_insert(tid, &key, &value),
            ) {
                Some(r) => break r,
                None => backoff.snooze(),
            }
        };
        self.epoch.enter_quiescent(tid);
        Ok(result)
    }

    pub fn insert_if_absent(&self, tid: usize, key: K, value: V) -> Result<bool, DictError> {
        if self.find(tid, &key).is_some() {
            return Ok(false);
        }
        Ok(self.insert(tid, key, value)?.is_none())
    }

    pub fn erase(&self, tid: usize, key: &K) -> Result<Option<V>, DictError> {
        self.epoch.leave_quiescent(tid);
        let backoff = Backoff::new();
        let result = loop {
            match self.attempt_erase(tid, key) {
                Some(r) => break r,
                None => backoff.snooze(),
            }
        };
        self.epoch.enter_quiescent(tid);
        Ok(result)
    }

    /// `Some(result)` linearizes; `None` means retry (LLX/SCX contention).
    fn attempt_insert(&self, tid: usize, key: &K, value: &V) -> Option<Option<V>> {
        let (gp, parent, leaf) = self.search_with_grandparent(key);
        let l = unsafe { &*leaf };
        let dummy = self.store.dummy_tagptr();

        if let Some(i) = l.keys.iter().position(|k| k == key) {
            // in-place replace: one new leaf swung in by the parent alone.
            let p_snap = llx(parent, &self.store, &self.epoch, tid)?;
            let old = l.values[i].clone();
            let mut values = l.values.clone();
            values[i] = value.clone();
            let new_leaf = Box::into_raw(Node::new_leaf(l.keys.clone(), values, dummy));
            let field_index = unsafe { &*parent }
                .children
                .iter()
                .position(|c| c.load(Ordering::Acquire) == leaf)?;
            let ok = scx(
                ScxArgs {
                    nodes: &[parent, leaf],
                    scx_seen: &[p_snap.scx_tagptr],
                    field_index,
                    new_node: new_leaf,
                    n_freeze: 1,
                },
                &self.store,
                &self.epoch,
                tid,
            );
            return Some(if ok {
                Some(old)
            } else {
                unsafe { drop(Box::from_raw(new_leaf)) };
                return None;
            });
        }

        if l.keys.len() < P::B {
            // room in the leaf: swing parent's child to a copy with the
            // key inserted in sorted position.
            let p_snap = llx(parent, &self.store, &self.epoch, tid)?;
            let mut keys = l.keys.clone();
            let mut values = l.values.clone();
            let at = keys.partition_point(|k| k < key);
            keys.insert(at, key.clone());
            values.insert(at, value.clone());
            let new_leaf = Box::into_raw(Node::new_leaf(keys, values, dummy));
            let field_index = unsafe { &*parent }
                .children
                .iter()
                .position(|c| c.load(Ordering::Acquire) == leaf)?;
            let ok = scx(
                ScxArgs {
                    nodes: &[parent, leaf],
                    scx_seen: &[p_snap.scx_tagptr],
                    field_index,
                    new_node: new_leaf,
                    n_freeze: 1,
                },
                &self.store,
                &self.epoch,
                tid,
            );
            return Some(if ok {
                None
            } else {
                unsafe { drop(Box::from_raw(new_leaf)) };
                return None;
            });
        }

        // overflow: split the leaf. `gp.is_null()` means `parent == entry`
        // directly (the tree's root is a bare leaf with no internal node
        // above it yet) — there is no distinct owner/parent pair to freeze
        // in that case, just `entry` itself gaining its first internal
        // level. Otherwise the commit target is `gp`, with the old
        // `parent` frozen alongside it while it is replaced wholesale.
        let mut keys = l.keys.clone();
        let mut values = l.values.clone();
        let at = keys.partition_point(|k| k < key);
        keys.insert(at, key.clone());
        values.insert(at, value.clone());
        let mid = keys.len() / 2;
        let left_leaf = Box::into_raw(Node::new_leaf(keys[..mid].to_vec(), values[..mid].to_vec(), dummy));
        let right_leaf = Box::into_raw(Node::new_leaf(keys[mid..].to_vec(), values[mid..].to_vec(), dummy));
        let routing_key = keys[mid].clone();

        if gp.is_null() {
            let entry_snap = llx(parent, &self.store, &self.epoch, tid)?;
            let new_internal = Box::into_raw(Node::new_internal(vec![routing_key], vec![left_leaf, right_leaf], dummy));
            let ok = scx(
                ScxArgs {
                    nodes: &[parent, leaf],
                    scx_seen: &[entry_snap.scx_tagptr],
                    field_index: 0,
                    new_node: new_internal,
                    n_freeze: 1,
                },
                &self.store,
                &self.epoch,
                tid,
            );
            return Some(if ok {
                None
            } else {
                unsafe {
                    drop(Box::from_raw(left_leaf));
                    drop(Box::from_raw(right_leaf));
                    drop(Box::from_raw(new_internal));
                }
                return None;
            });
        }

        let owner = gp;
        let owner_snap = llx(owner, &self.store, &self.epoch, tid)?;
        let parent_snap = llx(parent, &self.store, &self.epoch, tid)?;

        let p = unsafe { &*parent };
        let leaf_idx = match p.children.iter().position(|c| c.load(Ordering::Acquire) == leaf) {
            Some(i) => i,
            None => {
                unsafe {
                    drop(Box::from_raw(left_leaf));
                    drop(Box::from_raw(right_leaf));
                }
                return None;
            }
        };
        let mut new_parent_keys = p.keys.clone();
        new_parent_keys.insert(leaf_idx.min(p.keys.len()), routing_key);
        let mut new_parent_children: Vec<*mut Node<K, V>> = p.children.iter().map(|c| c.load(Ordering::Acquire)).collect();
        new_parent_children.splice(leaf_idx..=leaf_idx, [left_leaf, right_leaf]);
        let new_parent = Box::into_raw(Node::new_internal(new_parent_keys, new_parent_children, dummy));

        let owner_field = unsafe { &*owner }
            .children
            .iter()
            .position(|c| c.load(Ordering::Acquire) == parent);
        let owner_field = match owner_field {
            Some(i) => i,
            None => {
                unsafe {
                    drop(Box::from_raw(left_leaf));
                    drop(Box::from_raw(right_leaf));
                    drop(Box::from_raw(new_parent));
                }
                return None;
            }
        };

        let ok = scx(
            ScxArgs {
                nodes: &[owner, parent, leaf],
                scx_seen: &[owner_snap.scx_tagptr, parent_snap.scx_tagptr],
                field_index: owner_field,
                new_node: new_parent,
                n_freeze: 2,
            },
            &self.store,
            &self.epoch,
            tid,
        );
        Some(if ok {
            None
        } else {
            unsafe {
                drop(Box::from_raw(left_leaf));
                drop(Box::from_raw(right_leaf));
                drop(Box::from_raw(new_parent));
            }
            return None;
        })
    }

    /// Simplified erase: remove the key from its leaf's array, no
    /// merge/redistribution on underflow (see module docs — a documented
    /// Non-goal simplification, not a correctness gap in the LLX/SCX use).
    fn attempt_erase(&self, tid: usize, key: &K) -> Option<Option<V>> {
        let (_, parent, leaf) = self.search_with_grandparent(key);
        let l = unsafe { &*leaf };
        let Some(i) = l.keys.iter().position(|k| k == key) else {
            return Some(None);
        };
        let p_snap = llx(parent, &self.store, &self.epoch, tid)?;
        let old = l.values[i].clone();
        let mut keys = l.keys.clone();
        let mut values = l.values.clone();
        keys.remove(i);
        values.remove(i);
        let dummy = self.store.dummy_tagptr();
        let new_leaf = Box::into_raw(Node::new_leaf(keys, values, dummy));
        let field_index = unsafe { &*parent }
            .children
            .iter()
            .position(|c| c.load(Ordering::Acquire) == leaf)?;
        let ok = scx(
            ScxArgs {
                nodes: &[parent, leaf],
                scx_seen: &[p_snap.scx_tagptr],
                field_index,
                new_node: new_leaf,
                n_freeze: 1,
            },
            &self.store,
            &self.epoch,
            tid,
        );
        if ok {
            Some(Some(old))
        } else {
            unsafe { drop(Box::from_raw(new_leaf)) };
            None
        }
    }

    /// Writes up to `buffer.len()` key-value pairs in `[lo, hi]` into
    /// `buffer` and returns how many were written (spec §6, bounded
    /// non-allocating contract — see `SPEC_FULL.md` §6).
    pub fn range_query(&self, tid: usize, lo: &K, hi: &K, buffer: &mut [(K, V)]) -> usize {
        self.epoch.leave_quiescent(tid);
        let backoff = Backoff::new();
        loop {
            let mut count = 0usize;
            let mut valid = true;
            self.collect(self.entry_ptr(), lo, hi, buffer, &mut count, &mut valid);
            if valid {
                self.epoch.enter_quiescent(tid);
                return count;
            }
            backoff.snooze();
        }
    }

    fn collect(&self, node: *mut Node<K, V>, lo: &K, hi: &K, buffer: &mut [(K, V)], count: &mut usize, valid: &mut bool) {
        if *count >= buffer.len() {
            return;
        }
        let n = unsafe { &*node };
        if n.leaf {
            if n.marked.load(Ordering::Acquire) {
                *valid = false;
                return;
            }
            for (k, v) in n.keys.iter().zip(n.values.iter()) {
                if *count >= buffer.len() {
                    return;
                }
                if *lo <= *k && *k <= *hi {
                    buffer[*count] = (k.clone(), v.clone());
                    *count += 1;
                }
            }
            return;
        }
        for child in &n.children {
            self.collect(child.load(Ordering::Acquire), lo, hi, buffer, count, valid);
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn size(&self) -> usize {
        fn walk<K, V>(n: *mut Node<K, V>) -> usize {
            let node = unsafe { &*n };
            if node.leaf {
                node.keys.len()
            } else {
                node.children.iter().map(|c| walk(c.load(Ordering::Relaxed))).sum()
            }
        }
        walk(self.entry.children[0].load(Ordering::Relaxed))
    }
}

unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Node<K, V> {}
unsafe impl<K: Send, V: Send, P: AbtreeParams> Send for Abtree<K, V, P> {}
unsafe impl<K: Sync, V: Sync, P: AbtreeParams> Sync for Abtree<K, V, P> {}

impl<K: Ord + Clone, V: Clone, P: AbtreeParams> Dict<K, V> for Abtree<K, V, P> {
    fn init_thread(&self, tid: usize) {
        self.epoch.init_thread(tid);
        if let Some(signal) = self.crash_signal {
            self.epoch.install_crash_signal(tid, signal);
        }
    }
    fn deinit_thread(&self, tid: usize) {
        self.epoch.deinit_thread(tid);
    }
    fn find(&self, tid: usize, key: &K) -> Option<V> {
        Abtree::find(self, tid, key)
    }
    fn insert(&self, tid: usize, key: K, value: V) -> Result<Option<V>, DictError> {
        Abtree::insert(self, tid, key, value)
    }
    fn insert_if_absent(&self, tid: usize, key: K, value: V) -> Result<bool, DictError> {
        Abtree::insert_if_absent(self, tid, key, value)
    }
    fn erase(&self, tid: usize, key: &K) -> Result<Option<V>, DictError> {
        Abtree::erase(self, tid, key)
    }
    fn range_query(&self, tid: usize, lo: &K, hi: &K, buffer: &mut [(K, V)]) -> usize {
        Abtree::range_query(self, tid, lo, hi, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Abtree<i64, &'static str> {
        Abtree::new(8, DictConfig::default().without_htm())
    }

    #[test]
    fn insert_find_across_splits() {
        let t = fresh();
        t.init_thread(0);
        for k in 0..64i64 {
            assert_eq!(t.insert(0, k, "x").unwrap(), None);
        }
        for k in 0..64i64 {
            assert_eq!(t.find(0, &k), Some("x"));
        }
        assert_eq!(t.find(0, &1000), None);
        t.deinit_thread(0);
    }

    #[test]
    fn replace_and_erase() {
        let t = fresh();
        t.init_thread(0);
        t.insert(0, 5, "a").unwrap();
        assert_eq!(t.insert(0, 5, "b").unwrap(), Some("a"));
        assert_eq!(t.erase(0, &5).unwrap(), Some("b"));
        assert_eq!(t.find(0, &5), None);
        t.deinit_thread(0);
    }

    #[test]
    fn range_query_across_leaves() {
        let t = fresh();
        t.init_thread(0);
        for k in [10, 20, 30, 40, 50] {
            t.insert(0, k, "x").unwrap();
        }
        let mut buf = [(0i64, ""); 8];
        let count = t.range_query(0, &15, &45, &mut buf);
        assert_eq!(buf[..count].iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![20, 30, 40]);
        t.deinit_thread(0);
    }
}
