// Cursor / re-scan: an iterator that repairs itself when an interleaved
// insert renumbers leaf positions. See `btreeReadReScan` in `btree.c` and
// the join cursor cache in `index.c`'s `BTreeCacheCheck`; §4.6 of
// SPEC_FULL.md.

use crate::binary_search::partition_point;
use crate::cache::FastSlot;
use crate::comparator::OperatorClass;
use crate::error::Result;
use crate::lifecycle::{Index, PosCacheEntry};
use crate::node::Node;
use crate::offset::{BlockOffset, IndexRef};
use std::cmp::Ordering;

/// The engine's cursor: `(Ro, IRo)` from §3. `ro` is the data-record offset
/// the cursor currently names; `pos` encodes the leaf position, and may be
/// stale with respect to concurrent inserts — every step re-validates it
/// against `ro` before moving (the cursor-repair protocol).
#[derive(Copy, Clone, Debug)]
pub struct Cursor {
    pub ro: BlockOffset,
    pub pos: IndexRef,
}

impl Cursor {
    #[must_use]
    pub fn new(ro: BlockOffset, pos: IndexRef) -> Self {
        Self { ro, pos }
    }
}

/// Re-reads the leaf named by `cursor.pos`, repairing it if a concurrent
/// insert has shifted the cursor's element within (or out of) that leaf.
///
/// The insert logic (§4.4.1) guarantees a displaced key moves at most
/// backward to the leaf's start and then forward again, so scanning forward
/// from slot 0 within the leaf (and beyond, into following leaves, if it
/// over-ran entirely) is guaranteed to find it.
///
/// # Errors
/// Propagates I/O or decode errors. Returns [`crate::error::Error::ScanBroken`]
/// only via callers; this function itself never synthesizes that variant.
#[allow(clippy::indexing_slicing)]
fn re_scan_read(index: &Index, cursor: Cursor, fast: &mut FastSlot) -> Result<(BlockOffset, Node, usize)> {
    let (mut leaf_off, slot) = cursor.pos.decompose();
    let mut leaf = index.read_node(leaf_off, fast)?;

    if let Some(e) = leaf.elements().get(slot) {
        if e.ro == cursor.ro {
            return Ok((leaf_off, leaf, slot));
        }
    }

    // Repair: scan forward within this leaf first, then hop to following
    // leaves if it isn't here at all (the insert that displaced it split
    // this leaf).
    let mut start = 0usize;
    loop {
        if let Some(found) = leaf.elements()[start.min(leaf.elements().len())..]
            .iter()
            .position(|e| e.ro == cursor.ro)
        {
            let slot = start + found;
            return Ok((leaf_off, leaf, slot));
        }
        match next_leaf(index, leaf_off, fast)? {
            Some(off) => {
                leaf_off = off;
                leaf = index.read_node(leaf_off, fast)?;
                start = 0;
            }
            None => {
                return Err(crate::error::Error::CorruptHeader {
                    reason: "cursor-repair could not relocate its record",
                });
            }
        }
    }
}

/// Finds the leaf immediately to the right of `leaf_off` in key order, or
/// `None` if `leaf_off` is the tree's last leaf.
#[allow(clippy::indexing_slicing)]
fn next_leaf(index: &Index, leaf_off: BlockOffset, fast: &mut FastSlot) -> Result<Option<BlockOffset>> {
    let mut child_off = leaf_off;
    loop {
        let child = index.read_node(child_off, fast)?;
        if child.is_root() {
            return Ok(None);
        }
        let (parent_off, slot) = child.parent_slot();
        let parent = index.read_node(parent_off, fast)?;
        if slot + 1 < parent.elements().len() {
            let mut off = parent.elements()[slot + 1].ro;
            loop {
                let node = index.read_node(off, fast)?;
                if node.is_leaf() {
                    return Ok(Some(off));
                }
                off = node.elements()[0].ro;
            }
        }
        child_off = parent_off;
    }
}

/// Finds the leaf immediately to the left of `leaf_off` in key order, or
/// `None` if `leaf_off` is the tree's first leaf. Mirror of [`next_leaf`].
#[allow(clippy::indexing_slicing)]
fn prev_leaf(index: &Index, leaf_off: BlockOffset, fast: &mut FastSlot) -> Result<Option<BlockOffset>> {
    let mut child_off = leaf_off;
    loop {
        let child = index.read_node(child_off, fast)?;
        if child.is_root() {
            return Ok(None);
        }
        let (parent_off, slot) = child.parent_slot();
        let parent = index.read_node(parent_off, fast)?;
        if slot > 0 {
            let mut off = parent.elements()[slot - 1].ro;
            loop {
                let node = index.read_node(off, fast)?;
                if node.is_leaf() {
                    return Ok(Some(off));
                }
                off = node.elements()[node.elements().len() - 1].ro;
            }
        }
        child_off = parent_off;
    }
}

/// Advances the cursor one element forward in key order, repairing its
/// position first. Returns `None` once the tree's last element has already
/// been visited.
///
/// # Errors
/// Propagates I/O, decode, or cursor-repair failures.
#[allow(clippy::indexing_slicing)]
pub fn step_forward(index: &Index, cursor: Cursor, fast: &mut FastSlot) -> Result<Option<Cursor>> {
    let (leaf_off, leaf, slot) = re_scan_read(index, cursor, fast)?;
    let next_slot = slot + 1;
    if next_slot < leaf.elements().len() {
        let e = &leaf.elements()[next_slot];
        return Ok(Some(Cursor::new(e.ro, IndexRef::new(leaf_off, next_slot))));
    }
    match next_leaf(index, leaf_off, fast)? {
        None => Ok(None),
        Some(off) => {
            let node = index.read_node(off, fast)?;
            let e = node.elements().first().ok_or(crate::error::Error::CorruptHeader {
                reason: "leaf with no elements in chain",
            })?;
            Ok(Some(Cursor::new(e.ro, IndexRef::new(off, 0))))
        }
    }
}

/// Mirror of [`step_forward`]: steps one element backward in key order.
///
/// # Errors
/// Propagates I/O, decode, or cursor-repair failures.
#[allow(clippy::indexing_slicing)]
pub fn step_backward(index: &Index, cursor: Cursor, fast: &mut FastSlot) -> Result<Option<Cursor>> {
    let (leaf_off, leaf, slot) = re_scan_read(index, cursor, fast)?;
    if slot > 0 {
        let e = &leaf.elements()[slot - 1];
        return Ok(Some(Cursor::new(e.ro, IndexRef::new(leaf_off, slot - 1))));
    }
    match prev_leaf(index, leaf_off, fast)? {
        None => Ok(None),
        Some(off) => {
            let node = index.read_node(off, fast)?;
            let last = node.elements().len().checked_sub(1).ok_or(crate::error::Error::CorruptHeader {
                reason: "leaf with no elements in chain",
            })?;
            let e = &node.elements()[last];
            Ok(Some(Cursor::new(e.ro, IndexRef::new(off, last))))
        }
    }
}

/// Outcome of probing the join-cursor cache (§4.6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinProbe {
    /// No usable cached position (`-1`).
    Miss,
    /// The cached leaf alone answered the probe in full (`+1`).
    Complete(IndexRef, IndexRef),
}

/// Probes the index's cached equality-join cursor (the last leaf visited by
/// a previous equality probe on this index) for `c`. If the previous probe's
/// total range (`first_elm`/`last_elm`) matches the index's current range
/// and `c`'s whole answer lies within that one cached leaf, binary-searches
/// the leaf directly instead of a root-to-leaf descent.
///
/// # Errors
/// Propagates I/O or decode errors encountered while reading the cached leaf.
#[allow(clippy::indexing_slicing)]
pub fn probe_join_cache(index: &Index, c: &[u8], op: OperatorClass) -> Result<JoinProbe> {
    let Some(cached) = index.cached_pos() else {
        return Ok(JoinProbe::Miss);
    };
    if cached.first_elm != index.first_elm() || cached.last_elm != index.last_elm() {
        return Ok(JoinProbe::Miss);
    }

    let mut fast = FastSlot::new();
    let (leaf_off, _) = cached.pos.decompose();
    let leaf = index.read_node(leaf_off, &mut fast)?;
    let elements = leaf.elements();
    if elements.is_empty() {
        return Ok(JoinProbe::Miss);
    }
    let first_key = elements[0].key();
    let last_key = elements[elements.len() - 1].key();
    if op.compare(c, first_key) == Ordering::Less || op.compare(c, last_key) == Ordering::Greater {
        return Ok(JoinProbe::Miss);
    }

    let beg_slot = partition_point(elements, |e| op.compare(e.key(), c) == Ordering::Less);
    let end_slot = partition_point(elements, |e| op.compare(e.key(), c) != Ordering::Greater);
    if beg_slot >= elements.len() || end_slot == 0 || beg_slot >= end_slot {
        return Ok(JoinProbe::Miss);
    }

    Ok(JoinProbe::Complete(
        IndexRef::new(leaf_off, beg_slot),
        IndexRef::new(leaf_off, end_slot - 1),
    ))
}

/// Records `pos` as the index's join cursor cache, alongside the range it
/// was found under.
pub fn remember_join_cache(index: &Index, pos: IndexRef) {
    index.set_cached_pos(PosCacheEntry {
        pos,
        first_elm: index.first_elm(),
        last_elm: index.last_elm(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IndexMapCache;
    use crate::comparator::OperatorClass;
    use crate::constants::{NODE_CAP, WINDOW_SIZE};
    use crate::element::Element;
    use crate::mutator::insert;
    use crate::table_iface::{DataTable, RecordFingerprint, RecordHeader};
    use std::sync::Arc;
    use test_log::test;

    struct FakeTable;
    impl DataTable for FakeTable {
        fn first_block(&self) -> BlockOffset {
            BlockOffset(0)
        }
        fn next_block(&self, _bh: BlockOffset, _off: BlockOffset) -> Option<BlockOffset> {
            None
        }
        fn append(&self) -> BlockOffset {
            BlockOffset(0)
        }
        fn read_record(&self, _pos: BlockOffset) -> Result<RecordHeader> {
            unimplemented!()
        }
        fn column_value(&self, _pos: BlockOffset, _col: u32) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn fingerprint(&self, _pos: BlockOffset) -> Result<RecordFingerprint> {
            unimplemented!()
        }
        fn generation(&self) -> u64 {
            1
        }
    }

    fn new_index() -> Index {
        let cache = Arc::new(IndexMapCache::new(4));
        Index::open_temporary(1, 0, OperatorClass::Eq, cache, WINDOW_SIZE, &FakeTable).unwrap()
    }

    #[test]
    fn forward_iteration_visits_everything_in_key_order() {
        let index = new_index();
        let n = NODE_CAP as u64 * 3;
        for i in 0..n {
            let key = format!("k{i:05}");
            insert(&index, Element::new(BlockOffset(i + 1), key.as_bytes())).unwrap();
        }

        let mut fast = FastSlot::new();
        let (node_off, slot) = index.first_elm().decompose();
        let first = index.read_node(node_off, &mut fast).unwrap();
        let e = &first.elements()[slot];
        let mut cursor = Cursor::new(e.ro, index.first_elm());

        let mut seen = vec![cursor.ro.0];
        while let Some(next) = step_forward(&index, cursor, &mut fast).unwrap() {
            seen.push(next.ro.0);
            cursor = next;
        }
        let expected: Vec<u64> = (0..n).map(|i| i + 1).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn cursor_survives_an_insert_during_iteration() {
        let index = new_index();
        for i in 0..(NODE_CAP as u64) {
            let key = format!("k{i:05}");
            insert(&index, Element::new(BlockOffset(i + 1), key.as_bytes())).unwrap();
        }
        let mut fast = FastSlot::new();

        let start = crate::bounds::forward_bound(&index, b"k00010", OperatorClass::Eq)
            .unwrap()
            .unwrap();
        let (key, ro) = crate::bounds::resolve(&index, start.pos).unwrap();
        assert_eq!(key, b"k00010");
        let mut cursor = Cursor::new(ro, start.pos);

        // displace the cursor by inserting a new key before the current one,
        // forcing a shift of elements within the same leaf.
        insert(&index, Element::new(BlockOffset(9999), b"k00005b")).unwrap();

        let next = step_forward(&index, cursor, &mut fast).unwrap().unwrap();
        let (key, _) = crate::bounds::resolve(&index, next.pos).unwrap();
        assert_eq!(key, b"k00011");
        cursor = next;
        let _ = cursor;
    }
}
