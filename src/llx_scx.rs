/*
 * SPDX-License-Identifier: AGPL-3.0-or-later
 * Part of scxtree: lock-free concurrent ordered dictionaries built on LLX/SCX.
 */

//! LLX (load-linked-extended) / SCX (store-conditional-extended): the
//! multi-word CAS-like primitive every tree variant's non-transactional
//! update path is built on.
//!
//! Grounded on `examples/original_source/cpp/weak_descriptors/bst/bst.h`
//! (`llx`/`scx`/`help` declarations) and
//! `examples/original_source/cpp/debra/bst_impl.h` (their bodies). The
//! capability-trait polymorphism below (`ScxNode`) is the Rust expression
//! of spec §9's note that BST/(a,b)-tree/B-slack "share identical SCX
//! code" in the original — there, that sharing comes from C++ templates
//! over a node layout; here it comes from one generic fn over one trait,
//! the same shape `examples/skytable-skytable/server/src/engine/idx/mtchm/mod.rs`
//! uses to share `RawTree<T, C>` logic across configurations via its `C:
//! Config` type parameter.

use crate::descriptor::{DescriptorStore, ScxState, TagPtr, MAX_NODES};
use crate::epoch::EpochDomain;
use crate::sync::Backoff;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Capability set every node type (BST/(a,b)-tree/B-slack) must expose so
/// that `llx`/`scx`/`help` can operate on it without knowing the concrete
/// rebalancing shape. Mirrors the node fields declared in
/// `examples/original_source/cpp/weak_descriptors/bst_throwaway/node.h`
/// (`scxRecord`, `marked`, child pointers), generalized from BST's fixed
/// `left`/`right` to an indexed child-slot accessor so (a,b)-tree/B-slack
/// nodes (variable fan-out) implement the same trait.
pub trait ScxNode: Sized {
    /// Number of mutable child-pointer slots this node exposes. `0` for a
    /// leaf (external-BST leaves, and empty slots in wider nodes, carry no
    /// live children).
    fn num_children(&self) -> usize;
    /// The atomic pointer cell for child slot `i`. Panics if `i >=
    /// num_children()`.
    fn child(&self, i: usize) -> &AtomicPtr<Self>;
    /// The node's tag-pointer-valued SCX descriptor reference.
    fn scx_ptr(&self) -> &AtomicUsize;
    fn marked(&self) -> &AtomicBool;
    fn is_leaf(&self) -> bool {
        self.num_children() == 0
    }
}

/// Upper bound on a single node's child fan-out across every variant (BST:
/// 2, (a,b)-tree/B-slack: up to `b`). `DictConfig::max_fanout` (set in
/// `lib.rs`) is checked against this at construction time.
pub const MAX_FANOUT: usize = 16;

fn tagptr_to_usize(t: TagPtr) -> usize {
    t.to_bits()
}
fn usize_to_tagptr(v: usize) -> TagPtr {
    TagPtr::from_bits(v)
}

/// Outcome of a successful [`llx`].
pub struct LlxSnapshot<N> {
    pub node: *mut N,
    pub scx_tagptr: TagPtr,
    /// Children of `node` as observed at LLX time (used by callers that
    /// need to read them, e.g. a sibling's children during BST erase).
    pub children: [*mut N; MAX_FANOUT],
    pub num_children: usize,
}

/// Load-linked-extended: take a consistent snapshot of `node`'s SCX state
/// plus its mutable fields, failing if the node is concurrently frozen by
/// an in-progress or already-committed SCX (other than one this call
/// itself will help finish).
///
/// Linearizes at the final re-read of `scx_ptr` (spec §4.2: "the second
/// `scx_ptr` validation read must not be reordered before the mutable-
/// fields read").
pub fn llx<N: ScxNode>(
    node: *mut N,
    store: &DescriptorStore<N>,
    epoch: &EpochDomain,
    tid: usize,
) -> Option<LlxSnapshot<N>> {
    let n = unsafe { &*node };
    loop {
        let tp1 = usize_to_tagptr(n.scx_ptr().load(Ordering::Acquire));
        let marked = n.marked().load(Ordering::Acquire);
        if marked {
            return None;
        }
        let mut children = [std::ptr::null_mut(); MAX_FANOUT];
        let num_children = n.num_children();
        for i in 0..num_children {
            children[i] = n.child(i).load(Ordering::Acquire);
        }
        let tp2 = usize_to_tagptr(n.scx_ptr().load(Ordering::Acquire));
        if tp1 != tp2 {
            // concurrent SCX touched this node between our two reads; retry.
            continue;
        }
        if !store.is_dummy(tp1) {
            let d = store.descriptor(tp1);
            match d.state() {
                ScxState::Committed | ScxState::Aborted => {
                    // stale pointer left behind; safe to treat as if frozen
                    // by nobody, but must confirm via re-read below (same
                    // pattern as the fast path of the original's llx()).
                }
                ScxState::InProgress => {
                    // someone else's SCX is in flight on this node: help it
                    // finish (or abort) before proceeding, per the
                    // "help first, then retry" obligation of spec §4.3.
                    help(tp1, store, epoch, tid);
                    continue;
                }
            }
        }
        return Some(LlxSnapshot {
            node,
            scx_tagptr: tp1,
            children,
            num_children,
        });
    }
}

/// Arguments describing one SCX attempt, gathered by a tree's update
/// function per the contract "freeze `nodes[0..n_freeze)`, then swing
/// `nodes[0].child(field_index)` to `new_node`" (spec §4.2).
pub struct ScxArgs<'a, N> {
    pub nodes: &'a [*mut N],
    pub scx_seen: &'a [TagPtr],
    pub field_index: usize,
    pub new_node: *mut N,
    pub n_freeze: usize,
}

/// Store-conditional-extended: atomically freeze `nodes[0..n_freeze)`,
/// mark `nodes[n_freeze..]` (the nodes being spliced out, if any: by
/// convention in every tree variant here, nodes past `n_freeze` in the
/// descriptor are the ones becoming unreachable, e.g. BST erase's `l`),
/// then swing `nodes[0]`'s `field_index`-th child to `new_node`.
///
/// Returns `true` on success. On failure the caller must re-read the tree
/// and retry its update from scratch (the SCX gives no partial-progress
/// guarantee across failures).
pub fn scx<N: ScxNode>(
    args: ScxArgs<'_, N>,
    store: &DescriptorStore<N>,
    epoch: &EpochDomain,
    tid: usize,
) -> bool {
    debug_assert!(args.nodes.len() <= MAX_NODES);
    debug_assert!(args.n_freeze <= args.nodes.len());

    let tagptr = store.new_descriptor(
        tid,
        args.nodes,
        args.scx_seen,
        args.field_index,
        args.new_node,
        args.n_freeze,
    );
    help(tagptr, store, epoch, tid);
    let d = store.descriptor(tagptr);
    matches!(d.state(), ScxState::Committed)
}

/// Run (or help another thread run) the SCX identified by `tagptr` to
/// completion: freeze, mark, commit. Any thread — the owner or a helper —
/// executes exactly this function; idempotence (spec property P7) falls
/// out of every step being guarded by a CAS on the node's `scx_ptr` or on
/// the descriptor's `mutables` word.
pub fn help<N: ScxNode>(tagptr: TagPtr, store: &DescriptorStore<N>, epoch: &EpochDomain, tid: usize) {
    let snap = match store.snapshot(tagptr) {
        Some(s) => s,
        None => return, // reused/stale: whoever's operation this was has moved on.
    };
    let d = store.descriptor(tagptr);
    if !matches!(d.state(), ScxState::InProgress) {
        return;
    }

    let backoff = Backoff::new();

    // Step 1: freeze nodes[0..n_freeze) by CASing each one's scx_ptr from
    // the tag pointer it held at LLX time to `tagptr`.
    let mut highest = 0usize;
    let mut frozen_bitmap = 0u32;
    for i in 0..snap.n_freeze {
        let node = unsafe { &*snap.nodes[i] };
        let expected = tagptr_to_usize(snap.scx_seen[i]);
        let desired = tagptr_to_usize(tagptr);
        loop {
            match node
                .scx_ptr()
                .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    frozen_bitmap |= 1 << i;
                    highest = i + 1;
                    break;
                }
                Err(cur) if cur == desired => {
                    // already frozen by a concurrent helper for this same SCX.
                    frozen_bitmap |= 1 << i;
                    highest = i + 1;
                    break;
                }
                Err(_) => {
                    if d.try_abort(store.tagptr_seq(tagptr), i, frozen_bitmap) {
                        unfreeze(&snap, frozen_bitmap, tagptr, store);
                        return;
                    }
                    // someone else already moved our descriptor's state;
                    // re-check and bail if it's no longer in progress.
                    if !matches!(d.state(), ScxState::InProgress) {
                        return;
                    }
                    backoff.snooze();
                }
            }
        }
    }
    let _ = highest;

    // Step 2: publish all_frozen. From this point no abort can occur
    // (spec §4.3 step 2): any thread observing all_frozen must proceed to
    // mark + commit rather than unfreeze.
    d.publish_all_frozen(store.tagptr_seq(tagptr));

    // Step 3: mark every frozen node except nodes[0] (the parent, which
    // stays live — only its child pointer is swung in step 4). Matches
    // `bst_impl.h`'s `for (i=1;i<nFreeze;++i) nodes[i]->marked=true`.
    for i in 1..snap.n_freeze {
        let node = unsafe { &*snap.nodes[i] };
        node.marked().store(true, Ordering::Release);
    }

    // Step 4: commit CAS — swing nodes[0]'s child field to new_node. This
    // is the operation's linearization point.
    let parent = unsafe { &*snap.nodes[0] };
    let old_child = parent.child(snap.field_index).load(Ordering::Acquire);
    let _ = parent.child(snap.field_index).compare_exchange(
        old_child,
        snap.new_node,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    d.commit(store.tagptr_seq(tagptr));

    // Step 5: retire every node this SCX removed from the tree — both the
    // marked-frozen ancestors (nodes[1..n_freeze)) and the unfrozen
    // trailing nodes the caller listed as spliced out (nodes[n_freeze..
    // n_nodes), e.g. the old leaf in a BST erase). nodes[0] is excluded:
    // it stays reachable. Matches `bst_impl.h`'s
    // `for (j=1;j<nNodes;++j) recordmgr->retire(tid,nodes[j])`. Retiring
    // this descriptor's previous occupant is implicit: the reuse scheme
    // never frees descriptor slots, only the nodes they pointed at.
    for i in 1..snap.n_nodes {
        unsafe {
            let shared = crossbeam_epoch::Shared::<N>::from(snap.nodes[i] as *const N);
            epoch.retire(tid, shared);
        }
    }
}

/// Undo the freeze CASes performed up to (not including) the index that
/// failed, restoring each node's `scx_ptr` to what it held before this
/// attempt. Mirrors `bst_impl.h`'s `reclaimMemoryAfterSCX`-adjacent abort
/// handling: only nodes recorded in `frozen_bitmap` need unwinding.
fn unfreeze<N: ScxNode>(
    snap: &crate::descriptor::DescriptorSnapshot<N>,
    frozen_bitmap: u32,
    tagptr: TagPtr,
    store: &DescriptorStore<N>,
) {
    let _ = store;
    let desired = tagptr_to_usize(tagptr);
    for i in 0..snap.n_freeze {
        if frozen_bitmap & (1 << i) != 0 {
            let node = unsafe { &*snap.nodes[i] };
            let expected_restore = tagptr_to_usize(snap.scx_seen[i]);
            let _ = node.scx_ptr().compare_exchange(
                desired,
                expected_restore,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}
