// Bounds search: forward/reverse "find first matching or next" used to
// narrow a range against a constant predicate. See `BTreeFindBoundsFwd`/
// `BTreeFindBoundsRev` in `btree.c` and §4.5 of SPEC_FULL.md.
//
// Deviation from the reference algorithm: `btreeFindBounds{Fwd,Rev}` walks
// outward from a caller-supplied starting cursor (ascend, step, redescend)
// so that a bound lookup near a previous one is cheap. This port always
// descends fresh from the root, trying sibling subtrees left-to-right
// (forward) or right-to-left (reverse) as the recursion unwinds. Nodes are
// already cached by `IndexMapCache`, so the amortization the original chases
// buys little here, and a from-root descent is much easier to keep
// provably correct without being able to run the engine. Recorded in
// DESIGN.md.

use crate::binary_search::partition_point;
use crate::cache::FastSlot;
use crate::comparator::OperatorClass;
use crate::error::Result;
use crate::lifecycle::Index;
use crate::offset::{BlockOffset, IndexRef};
use std::cmp::Ordering;

/// Outcome of a bound search, mirroring the reference implementation's
/// `status` out-parameter (`0`/`+1`/`-1`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundStatus {
    /// The found element's key equals the predicate (`status == 0`).
    Equal,
    /// The found element is the nearest qualifying element but its key does
    /// not equal the predicate (`status == +1` forward, `-1` reverse).
    Near,
    /// No qualifying element exists anywhere in the tree (`status == -1`).
    Empty,
}

/// A located element alongside the status describing how it relates to the
/// search key.
#[derive(Copy, Clone, Debug)]
pub struct BoundResult {
    pub pos: IndexRef,
    pub status: BoundStatus,
}

/// Finds the smallest leaf element `x` with `x.key >= c` under `op`.
///
/// # Errors
/// Propagates I/O or decode errors encountered while reading nodes.
pub fn forward_bound(index: &Index, c: &[u8], op: OperatorClass) -> Result<Option<BoundResult>> {
    let mut fast = FastSlot::new();
    forward_rec(index, index.root(), c, op, &mut fast)
}

#[allow(clippy::indexing_slicing)]
fn forward_rec(
    index: &Index,
    node_off: BlockOffset,
    c: &[u8],
    op: OperatorClass,
    fast: &mut FastSlot,
) -> Result<Option<BoundResult>> {
    let node = index.read_node(node_off, fast)?;
    let elements = node.elements();

    if node.is_leaf() {
        // First slot with key >= c.
        let slot = partition_point(elements, |e| op.compare(e.key(), c) == Ordering::Less);
        if slot >= elements.len() {
            return Ok(None);
        }
        let status = if op.compare(elements[slot].key(), c) == Ordering::Equal {
            BoundStatus::Equal
        } else {
            BoundStatus::Near
        };
        return Ok(Some(BoundResult {
            pos: IndexRef::new(node_off, slot),
            status,
        }));
    }

    // Candidate subtrees: every child whose own key could hold the target,
    // i.e. from "one slot back" of the first child key exceeding `c` onward
    // to the rightmost child (§4.5 step 3's "step back one slot").
    let first_gt = partition_point(elements, |e| op.compare(e.key(), c) != Ordering::Greater);
    let start = first_gt.saturating_sub(1);

    for (idx, elm) in elements.iter().enumerate().skip(start) {
        if let Some(result) = forward_rec(index, elm.ro, c, op, fast)? {
            return Ok(Some(result));
        }
        let _ = idx;
    }
    Ok(None)
}

/// Finds the largest leaf element `x` with `x.key <= c` under `op`.
///
/// # Errors
/// Propagates I/O or decode errors encountered while reading nodes.
pub fn reverse_bound(index: &Index, c: &[u8], op: OperatorClass) -> Result<Option<BoundResult>> {
    let mut fast = FastSlot::new();
    reverse_rec(index, index.root(), c, op, &mut fast)
}

#[allow(clippy::indexing_slicing)]
fn reverse_rec(
    index: &Index,
    node_off: BlockOffset,
    c: &[u8],
    op: OperatorClass,
    fast: &mut FastSlot,
) -> Result<Option<BoundResult>> {
    let node = index.read_node(node_off, fast)?;
    let elements = node.elements();

    if node.is_leaf() {
        // Last slot with key <= c: one before the first key strictly > c.
        let first_gt = partition_point(elements, |e| op.compare(e.key(), c) != Ordering::Greater);
        if first_gt == 0 {
            return Ok(None);
        }
        let slot = first_gt - 1;
        let status = if op.compare(elements[slot].key(), c) == Ordering::Equal {
            BoundStatus::Equal
        } else {
            BoundStatus::Near
        };
        return Ok(Some(BoundResult {
            pos: IndexRef::new(node_off, slot),
            status,
        }));
    }

    let first_gt = partition_point(elements, |e| op.compare(e.key(), c) != Ordering::Greater);
    if first_gt == 0 {
        // every child key exceeds c: no candidate in this subtree at all.
        return Ok(None);
    }
    let start = first_gt - 1;

    for idx in (0..=start).rev() {
        let elm = &elements[idx];
        if let Some(result) = reverse_rec(index, elm.ro, c, op, fast)? {
            return Ok(Some(result));
        }
    }
    Ok(None)
}

/// Resolves a [`BoundResult`] to the key bytes and record offset of the
/// element it names. Convenience for callers that need both.
///
/// # Errors
/// Propagates I/O or decode errors encountered while reading the leaf.
#[allow(clippy::indexing_slicing)]
pub fn resolve(index: &Index, pos: IndexRef) -> Result<(Vec<u8>, BlockOffset)> {
    let mut fast = FastSlot::new();
    let (node_off, slot) = pos.decompose();
    let node = index.read_node(node_off, &mut fast)?;
    let elm = &node.elements()[slot];
    Ok((elm.key().to_vec(), elm.ro))
}
