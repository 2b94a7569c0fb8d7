// Tree mutator: insertion, node splitting, parent-pointer maintenance. See
// `btreeInsert`/`btreeSplit`/`btreeInsertPhys` in `btree.c` and §4.4 of
// SPEC_FULL.md.

use crate::binary_search::partition_point;
use crate::cache::FastSlot;
use crate::constants::{NODE_CAP, SPLIT_HALF};
use crate::element::Element;
use crate::error::Result;
use crate::lifecycle::Index;
use crate::node::Node;
use crate::offset::{BlockOffset, IndexRef};
use std::cmp::Ordering;

/// This insertion is a candidate for the tree-wide minimum key.
pub(crate) const INSERT_FIRST: u8 = 0x01;
/// This insertion is a candidate for the tree-wide maximum key.
pub(crate) const INSERT_LAST: u8 = 0x02;

/// Inserts `elm` into the tree rooted at `index.root()`, splitting nodes and
/// growing a new root as needed. Always offers `elm` as a candidate for both
/// the new `first_elm`/`last_elm`; the recursive descent narrows those
/// flags down to whichever is actually true, mirroring the reference
/// implementation's callers, which always pass `BIF_FIRST|BIF_LAST` and let
/// `btreeInsert` work out which (if either) really applies.
#[allow(clippy::indexing_slicing)]
pub fn insert(index: &Index, elm: Element) -> Result<()> {
    let root = index.root();
    if let Some(promoted) = insert_rec(index, root, elm, INSERT_FIRST | INSERT_LAST)? {
        let mut new_root = Node::new(false);
        new_root.count = 2;
        new_root.elms[0] = Element {
            ro: root,
            ..Element::empty()
        };
        new_root.elms[1] = promoted;
        let new_root_off = index.append_node(&new_root)?;
        index.set_root(new_root_off)?;
    }
    Ok(())
}

/// Recursive insertion step. Returns `Some(promoted)` if `bnro` had to
/// split, giving the caller a new element (key prefix + offset of the new
/// right half) to insert one level up; `None` if the insert completed
/// without propagating a split.
#[allow(clippy::indexing_slicing)]
fn insert_rec(index: &Index, bnro: BlockOffset, elm: Element, flags: u8) -> Result<Option<Element>> {
    let mut fast = FastSlot::new();
    let mut bn = index.read_node(bnro, &mut fast)?;
    let op = index.op_class();

    // First slot with elms[slot] > elm, then step back one: e belongs just
    // after the result (§4.4 step 2).
    let stop = partition_point(bn.elements(), |e| {
        op.compare(e.key(), elm.key()) != Ordering::Greater
    });
    let count = bn.elements().len();
    let mut i: isize = stop as isize - 1;

    let mut flags = flags;
    if i != count as isize - 1 {
        flags &= !INSERT_LAST;
    }

    let is_leaf = bn.is_leaf();
    let promoted = if is_leaf {
        Some(elm)
    } else {
        let j = if i > 0 {
            flags &= !INSERT_FIRST;
            i as usize
        } else {
            0
        };
        let child_off = bn.elements()[j].ro;
        match insert_rec(index, child_off, elm, flags)? {
            None => None,
            Some(p) => {
                // the recursive call may have mutated bnro's own contents
                // (a lower split rewrites parent back-pointers but never
                // this node's elements, so this is a defensive re-read
                // rather than a correctness requirement); matches the
                // reference implementation's own re-read after recursion.
                bn = index.read_node(bnro, &mut FastSlot::new())?;
                Some(p)
            }
        }
    };

    let Some(be) = promoted else {
        return Ok(None);
    };

    i += 1;
    if i != 0 {
        flags &= !INSERT_FIRST;
    }
    let slot = i as usize;

    if bn.is_full() {
        split(index, bnro, &bn, slot, be, flags).map(Some)
    } else {
        insert_in_place(index, bnro, &bn, slot, Some(be), flags)?;
        Ok(None)
    }
}

/// Splits the full node `bn` (currently at `bnro`) into two halves, inserts
/// `elm` into whichever half `slot` falls into, and returns the element the
/// caller must insert one level up: the right half's first key, paired with
/// its newly appended offset. See §4.4.2.
#[allow(clippy::indexing_slicing)]
fn split(
    index: &Index,
    bnro: BlockOffset,
    bn: &Node,
    slot: usize,
    elm: Element,
    flags: u8,
) -> Result<Element> {
    let mut left = Node {
        parent: bn.parent,
        count: SPLIT_HALF as i16,
        flags: bn.flags,
        elms: vec![Element::empty(); NODE_CAP],
    };
    left.elms[..SPLIT_HALF].copy_from_slice(&bn.elms[..SPLIT_HALF]);

    let mut right = Node {
        parent: BlockOffset(0),
        count: SPLIT_HALF as i16,
        flags: bn.flags,
        elms: vec![Element::empty(); NODE_CAP],
    };
    right.elms[..SPLIT_HALF].copy_from_slice(&bn.elms[SPLIT_HALF..NODE_CAP]);

    // bn1 keeps its offset; write it before bn2 is appended so a concurrent
    // reader never observes bn2's children pointing at a parent that
    // hasn't been written yet.
    index.write_node(bnro, &left)?;
    let right_off = index.append_node(&right)?;

    let mut promoted = right.elms[0];
    promoted.flags = 0;
    promoted.ro = right_off;

    // Preemptive last_elm fixup: a node being split is full (NODE_CAP
    // elements), so if it held the tree-wide last element, that element was
    // necessarily at the node's final slot, which lands at local slot
    // SPLIT_HALF - 1 in the right half.
    let (last_node, last_slot) = index.last_elm().decompose();
    if last_node == bnro {
        debug_assert_eq!(
            last_slot,
            NODE_CAP - 1,
            "a full node's last_elm must sit in its final slot"
        );
        index.set_last_elm(IndexRef::new(right_off, SPLIT_HALF - 1))?;
    }

    if slot <= SPLIT_HALF {
        insert_in_place(index, bnro, &left, slot, Some(elm), flags)?;
    } else {
        insert_in_place(index, right_off, &right, slot - SPLIT_HALF, Some(elm), flags)?;
    }

    Ok(promoted)
}

/// Splices `elm` into `bn` (currently at `node_off`) at `slot`, writes the
/// new node image, and fixes up `first_elm`/`last_elm`/child parent
/// pointers. `elm: None` applies only the bookkeeping, not an insertion
/// (unused in this port — every call site has an element to insert — kept
/// as an `Option` to mirror `btreeInsertPhys`'s `be == NULL` call shape).
/// See §4.4.1.
#[allow(clippy::indexing_slicing)]
fn insert_in_place(
    index: &Index,
    node_off: BlockOffset,
    bn: &Node,
    slot: usize,
    elm: Option<Element>,
    flags: u8,
) -> Result<()> {
    let mut nbn = bn.clone();
    if let Some(e) = elm {
        let count = nbn.count as usize;
        debug_assert!(slot <= count, "insertion slot out of range");
        for j in (slot..count).rev() {
            nbn.elms[j + 1] = nbn.elms[j];
        }
        nbn.elms[slot] = e;
        nbn.count = (count + 1) as i16;
        index.write_node(node_off, &nbn)?;
    }

    let is_leaf = nbn.is_leaf();
    if is_leaf && flags & INSERT_FIRST != 0 {
        index.set_first_elm(IndexRef::new(node_off, slot))?;
    }
    if is_leaf && flags & INSERT_LAST != 0 {
        index.set_last_elm(IndexRef::new(node_off, slot))?;
    } else {
        let (last_node, last_slot) = index.last_elm().decompose();
        if last_node == node_off {
            debug_assert_eq!(
                last_slot + 1,
                nbn.count as usize - 1,
                "last_elm shift fixup slot mismatch"
            );
            index.set_last_elm(IndexRef::new(node_off, last_slot + 1))?;
        }
    }

    if !is_leaf {
        for s in slot..nbn.count as usize {
            let child_off = nbn.elms[s].ro;
            let mut fast = FastSlot::new();
            let mut child = index.read_node(child_off, &mut fast)?;
            child.set_parent_slot(node_off, s);
            index.write_node(child_off, &child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IndexMapCache;
    use crate::comparator::OperatorClass;
    use crate::constants::WINDOW_SIZE;
    use crate::offset::BlockOffset;
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
            unimplemented!("not needed for mutator tests")
        }
        fn column_value(&self, _pos: BlockOffset, _col: u32) -> Result<Vec<u8>> {
            unimplemented!("not needed for mutator tests")
        }
        fn fingerprint(&self, _pos: BlockOffset) -> Result<RecordFingerprint> {
            unimplemented!("not needed for mutator tests")
        }
        fn generation(&self) -> u64 {
            1
        }
    }

    fn new_index() -> Index {
        let cache = Arc::new(IndexMapCache::new(4));
        Index::open_temporary(1, 0, OperatorClass::Eq, cache, WINDOW_SIZE, &FakeTable).unwrap()
    }

    fn in_order_keys(index: &Index) -> Vec<Vec<u8>> {
        fn walk(index: &Index, off: BlockOffset, out: &mut Vec<Vec<u8>>) {
            let mut fast = FastSlot::new();
            let node = index.read_node(off, &mut fast).unwrap();
            if node.is_leaf() {
                out.extend(node.elements().iter().map(|e| e.key().to_vec()));
            } else {
                for e in node.elements() {
                    walk(index, e.ro, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(index, index.root(), &mut out);
        out
    }

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn sequential_insert_keeps_sorted_order_and_tracks_extremes() {
        let index = new_index();
        let mut keys: Vec<Vec<u8>> = (0..500u32).map(|n| format!("k{n:05}").into_bytes()).collect();
        // insert out of order to exercise both halves of every split
        let mut shuffled = keys.clone();
        shuffled.sort_by(|a, b| (a.len() + a[0] as usize).cmp(&(b.len() + b[0] as usize)));
        for (i, key) in keys.iter().enumerate() {
            let elm = Element::new(BlockOffset((i as u64 + 1) * 8), key);
            insert(&index, elm).unwrap();
        }
        keys.sort();
        assert_eq!(in_order_keys(&index), keys);

        let (first_node, first_slot) = index.first_elm().decompose();
        let mut fast = FastSlot::new();
        let first_leaf = index.read_node(first_node, &mut fast).unwrap();
        assert_eq!(first_leaf.elements()[first_slot].key(), keys[0].as_slice());

        let (last_node, last_slot) = index.last_elm().decompose();
        let last_leaf = index.read_node(last_node, &mut fast).unwrap();
        assert_eq!(
            last_leaf.elements()[last_slot].key(),
            keys[keys.len() - 1].as_slice()
        );
    }

    #[test]
    fn equal_keys_preserve_insertion_order() {
        let index = new_index();
        for i in 0..20u64 {
            let elm = Element::new(BlockOffset((i + 1) * 8), b"dup");
            insert(&index, elm).unwrap();
        }
        let mut fast = FastSlot::new();
        fn collect_ros(index: &Index, off: BlockOffset, fast: &mut FastSlot, out: &mut Vec<u64>) {
            let node = index.read_node(off, fast).unwrap();
            if node.is_leaf() {
                out.extend(node.elements().iter().map(|e| e.ro.0));
            } else {
                for e in node.elements() {
                    collect_ros(index, e.ro, fast, out);
                }
            }
        }
        let mut ros = Vec::new();
        collect_ros(&index, index.root(), &mut fast, &mut ros);
        let expected: Vec<u64> = (0..20u64).map(|i| (i + 1) * 8).collect();
        assert_eq!(ros, expected);
    }

    #[test]
    fn split_preserves_in_order_sequence() {
        let index = new_index();
        // exactly fill and then overflow one leaf to force a single split.
        for i in 0..(NODE_CAP as u64 + 1) {
            let key = format!("k{i:05}");
            let elm = Element::new(BlockOffset((i + 1) * 8), key.as_bytes());
            insert(&index, elm).unwrap();
        }
        let got = in_order_keys(&index);
        let mut expected: Vec<Vec<u8>> = (0..(NODE_CAP as u64 + 1))
            .map(|i| format!("k{i:05}").into_bytes())
            .collect();
        expected.sort();
        assert_eq!(got, expected);
    }
}
