// Range-scan driver: combines an index range with the non-indexed tail and
// pairs insert/delete records via a content-hash. See
// `DefaultIndexScanRangeOp1`/`Op2` in `index.c` and §4.7 of SPEC_FULL.md.

use crate::bounds::{self, BoundStatus};
use crate::cache::FastSlot;
use crate::comparator::OperatorClass;
use crate::cursor::{self, Cursor};
use crate::error::{Error, Result};
use crate::lazy_update;
use crate::lifecycle::Index;
use crate::offset::{BlockOffset, IndexRef};
use crate::stop_signal::StopSignal;
use crate::table_iface::{DataTable, RecordFingerprint};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The relational operator a constant predicate applies, independent of the
/// index's [`OperatorClass`] (which instead picks *how* keys compare).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

/// A narrowed index range plus the scan's snapshot boundary. Produced by
/// [`set_range`]; consumed by [`RangeScan::new`].
#[derive(Clone, Debug)]
pub struct ScanRange {
    /// Smallest qualifying leaf position, or `None` if the range is empty.
    pub beg: Option<IndexRef>,
    /// Largest qualifying leaf position, or `None` if the range is empty.
    pub end: Option<IndexRef>,
    /// The table's append point at range-setup time (§4.7 step 1): records
    /// at or beyond this offset are invisible to this scan.
    pub ti_append: BlockOffset,
    /// Whether a "special field" predicate is active, engaging the
    /// force-save delete-hash rule (§4.7's equality-hash sweep rule).
    pub force_save: bool,
}

/// Sets up a range for `predicate` against `index`, catching the index up to
/// the table first if it's fallen more than `slop` bytes behind (or
/// `demand_sync` is set). See §4.7 step 1-2.
///
/// # Errors
/// Propagates catch-up, I/O, or decode errors.
pub fn set_range(
    index: &Index,
    table: &dyn DataTable,
    predicate: Option<(&[u8], Relation)>,
    slop: u64,
    demand_sync: bool,
    stop: &StopSignal,
    yield_fn: &mut dyn FnMut(),
) -> Result<ScanRange> {
    if lazy_update::needs_catch_up(index, table, slop, demand_sync) {
        lazy_update::catch_up(index, table, stop, yield_fn)?;
    }

    let ti_append = table.append();
    let op = index.op_class();
    let force_save = predicate.is_some_and(|(_, _)| op.is_special_field());

    let (beg, end) = match predicate {
        None => (Some(index.first_elm()), Some(index.last_elm())),
        Some((c, rel)) => narrow(index, c, rel, op)?,
    };

    let (beg, end) = match (beg, end) {
        (Some(b), Some(e)) if range_ordered(index, b, e, op)? => (Some(b), Some(e)),
        _ => (None, None),
    };

    Ok(ScanRange {
        beg,
        end,
        ti_append,
        force_save,
    })
}

fn narrow(
    index: &Index,
    c: &[u8],
    rel: Relation,
    op: OperatorClass,
) -> Result<(Option<IndexRef>, Option<IndexRef>)> {
    let mut fast = FastSlot::new();
    Ok(match rel {
        Relation::Eq => {
            let fwd = bounds::forward_bound(index, c, op)?;
            let rev = bounds::reverse_bound(index, c, op)?;
            match (fwd, rev) {
                (Some(f), Some(r)) if f.status == BoundStatus::Equal && r.status == BoundStatus::Equal => {
                    (Some(f.pos), Some(r.pos))
                }
                _ => (None, None),
            }
        }
        Relation::Ge => match bounds::forward_bound(index, c, op)? {
            Some(f) => (Some(f.pos), Some(index.last_elm())),
            None => (None, None),
        },
        Relation::Gt => match bounds::forward_bound(index, c, op)? {
            Some(f) if f.status == BoundStatus::Equal => {
                let cur = Cursor::new(bounds::resolve(index, f.pos)?.1, f.pos);
                match cursor::step_forward(index, cur, &mut fast)? {
                    Some(next) => (Some(next.pos), Some(index.last_elm())),
                    None => (None, None),
                }
            }
            Some(f) => (Some(f.pos), Some(index.last_elm())),
            None => (None, None),
        },
        Relation::Le => match bounds::reverse_bound(index, c, op)? {
            Some(r) => (Some(index.first_elm()), Some(r.pos)),
            None => (None, None),
        },
        Relation::Lt => match bounds::reverse_bound(index, c, op)? {
            Some(r) if r.status == BoundStatus::Equal => {
                let cur = Cursor::new(bounds::resolve(index, r.pos)?.1, r.pos);
                match cursor::step_backward(index, cur, &mut fast)? {
                    Some(prev) => (Some(index.first_elm()), Some(prev.pos)),
                    None => (None, None),
                }
            }
            Some(r) => (Some(index.first_elm()), Some(r.pos)),
            None => (None, None),
        },
    })
}

/// Checks that `beg` precedes or sits at `end` and that both name an actual
/// element (not an unpopulated slot) — a best-effort replacement for
/// comparing full tree positions, since node offsets don't track key order
/// (they're assigned in append/creation order, not sorted order): resolve
/// both positions' keys and compare them under `op` instead.
fn range_ordered(index: &Index, beg: IndexRef, end: IndexRef, op: OperatorClass) -> Result<bool> {
    let mut fast = FastSlot::new();
    let (beg_off, beg_slot) = beg.decompose();
    let (end_off, end_slot) = end.decompose();
    let beg_node = index.read_node(beg_off, &mut fast)?;
    let end_node = index.read_node(end_off, &mut fast)?;
    let (Some(beg_elm), Some(end_elm)) = (beg_node.elements().get(beg_slot), end_node.elements().get(end_slot)) else {
        return Ok(false);
    };
    Ok(op.compare(beg_elm.key(), end_elm.key()) != Ordering::Greater)
}

/// A predicate evaluated during the scan's own pairing pass — distinct from
/// the executor's authoritative re-check (§4.3's "inconclusive-positive"
/// rule): this only decides whether a record participates in the
/// delete-hash sweep, not whether it's semantically correct to return.
fn predicate_matches(
    table: &dyn DataTable,
    pos: BlockOffset,
    col: u32,
    predicate: Option<(&[u8], Relation)>,
    op: OperatorClass,
) -> Result<bool> {
    let Some((c, rel)) = predicate else {
        return Ok(true);
    };
    let value = table.column_value(pos, col)?;
    let ord = op.compare(&value, c);
    Ok(match rel {
        Relation::Eq => ord == Ordering::Equal,
        Relation::Ge => ord != Ordering::Less,
        Relation::Gt => ord == Ordering::Greater,
        Relation::Le => ord != Ordering::Greater,
        Relation::Lt => ord == Ordering::Less,
    })
}

/// Drives one range scan: walks the narrowed index range back to front,
/// pairing tombstones against the insertions they cancel via a per-scan
/// delete-hash, then falls through to the un-indexed tail. See §4.7.
///
/// `DataTable` only walks forward (`next_block`), so the un-indexed tail
/// can't be iterated back to front the way the indexed range can via
/// [`cursor::step_backward`]. Rather than dispatch between a
/// `scan_reverse_one_pass`/`scan_forward_two_pass` pair of named algorithms
/// (§4.7's `Op2`/`Op1`) this type always runs both, in the order each needs:
/// a forward pre-pass over the tail enters its tombstones into the hash
/// (mirroring `Op1`'s first pass, scoped to just the part of the range that
/// genuinely requires it), then the indexed range is walked in reverse
/// (`Op2`) — which also sees tombstones for indexed-range insertions as it
/// goes — and finally the tail is walked forward a second time to match its
/// insertions against whatever the first two stages entered. An insert in
/// the indexed range can only ever be cancelled by a tombstone at a higher
/// record offset (never lower — a row can't be deleted before it exists),
/// and the tail's offsets are all higher than the indexed range's, so this
/// ordering — tail tombstones, then indexed range, then tail insertions —
/// always sees a cancelling tombstone before the insertion it cancels.
/// Recorded as a deviation in DESIGN.md.
///
/// The delete-hash is confined to this scan's lifetime (never shared across
/// scans, per the design note in SPEC_FULL.md §9); [`RangeScan::finish`]
/// enforces the end-of-scan emptiness contract.
pub struct RangeScan<'a> {
    index: &'a Index,
    table: &'a dyn DataTable,
    col: u32,
    predicate: Option<(&'a [u8], Relation)>,
    op: OperatorClass,
    ti_append: BlockOffset,
    force_save: bool,
    cursor: Option<Cursor>,
    beg: Option<IndexRef>,
    indexed_done: bool,
    slop_start: BlockOffset,
    slop_pos: Option<BlockOffset>,
    delete_hash: HashMap<RecordFingerprint, u32>,
    interrupted: bool,
}

impl<'a> RangeScan<'a> {
    /// # Errors
    /// Propagates I/O or decode errors encountered resolving the range's
    /// end position to seed the cursor, or reading the un-indexed tail's
    /// tombstone pre-pass.
    pub fn new(
        index: &'a Index,
        table: &'a dyn DataTable,
        col: u32,
        predicate: Option<(&'a [u8], Relation)>,
        range: &ScanRange,
    ) -> Result<Self> {
        let cursor = match range.end {
            Some(pos) => {
                let (_, ro) = bounds::resolve(index, pos)?;
                Some(Cursor::new(ro, pos))
            }
            None => None,
        };

        let tab_append = index.tab_append();
        let slop_start = if tab_append.0 == 0 { table.first_block() } else { tab_append };
        let mut delete_hash = HashMap::new();
        let mut pos = slop_start;
        while pos.0 < range.ti_append.0 {
            let header = table.read_record(pos)?;
            if header.is_tombstone() {
                let fp = table.fingerprint(pos)?;
                *delete_hash.entry(fp).or_insert(0) += 1;
            }
            match table.next_block(table.first_block(), pos) {
                Some(next) if next.0 < range.ti_append.0 => pos = next,
                _ => break,
            }
        }

        Ok(Self {
            index,
            table,
            col,
            predicate,
            op: index.op_class(),
            ti_append: range.ti_append,
            force_save: range.force_save,
            cursor,
            beg: range.beg,
            indexed_done: range.beg.is_none() || range.end.is_none(),
            slop_start,
            slop_pos: None,
            delete_hash,
            interrupted: false,
        })
    }

    /// Signals that the caller is stopping the scan early (§5 cancellation).
    /// The end-of-scan emptiness assertion in [`Self::finish`] is then
    /// tolerated rather than enforced.
    pub fn break_early(&mut self) {
        self.interrupted = true;
    }

    fn resolve_fingerprint(&self, pos: BlockOffset) -> Result<RecordFingerprint> {
        self.table.fingerprint(pos)
    }

    #[cfg(test)]
    fn delete_hash_len(&self) -> usize {
        self.delete_hash.len()
    }

    /// Indexed-range step: every element here is already known to sit inside
    /// the narrowed range, so tombstones are entered unconditionally and
    /// insertions are matched-and-forgotten against the hash.
    fn process_indexed(&mut self, pos: BlockOffset) -> Result<Option<BlockOffset>> {
        if pos.0 >= self.ti_append.0 {
            return Ok(None);
        }
        let header = self.table.read_record(pos)?;

        if header.is_tombstone() {
            let fp = self.resolve_fingerprint(pos)?;
            *self.delete_hash.entry(fp).or_insert(0) += 1;
            return Ok(None);
        }

        self.match_insertion(pos)
    }

    /// Un-indexed tail step, second pass: tombstones were already entered by
    /// the constructor's forward pre-pass, so this only matches insertions.
    fn process_slop(&mut self, pos: BlockOffset) -> Result<Option<BlockOffset>> {
        if pos.0 >= self.ti_append.0 {
            return Ok(None);
        }
        let header = self.table.read_record(pos)?;
        if header.is_tombstone() {
            return Ok(None);
        }
        self.match_insertion(pos)
    }

    fn match_insertion(&mut self, pos: BlockOffset) -> Result<Option<BlockOffset>> {
        let passes = predicate_matches(self.table, pos, self.col, self.predicate, self.op)?;
        if !passes && !self.force_save {
            return Ok(None);
        }

        let fp = self.resolve_fingerprint(pos)?;
        let cancelled = match self.delete_hash.get_mut(&fp) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.delete_hash.remove(&fp);
                }
                true
            }
            _ => false,
        };
        if cancelled || !passes {
            return Ok(None);
        }
        Ok(Some(pos))
    }

    fn next_indexed(&mut self) -> Result<Option<BlockOffset>> {
        loop {
            let Some(cursor) = self.cursor else {
                self.indexed_done = true;
                return Ok(None);
            };
            let pos = cursor.ro;
            let at_start = self.beg.is_some_and(|b| positions_equal(cursor.pos, b));

            let mut fast = FastSlot::new();
            self.cursor = if at_start {
                None
            } else {
                cursor::step_backward(self.index, cursor, &mut fast)?
            };
            if self.cursor.is_none() {
                self.indexed_done = true;
            }

            if let Some(found) = self.process_indexed(pos)? {
                return Ok(Some(found));
            }
            if self.indexed_done {
                return Ok(None);
            }
        }
    }

    fn next_slop(&mut self) -> Result<Option<BlockOffset>> {
        loop {
            let pos = match self.slop_pos {
                Some(p) => p,
                None => self.slop_start,
            };
            if pos.0 >= self.ti_append.0 {
                return Ok(None);
            }
            let next = self.table.next_block(self.table.first_block(), pos);
            self.slop_pos = next.or(Some(BlockOffset(self.ti_append.0)));

            if let Some(found) = self.process_slop(pos)? {
                return Ok(Some(found));
            }
            if next.is_none() {
                return Ok(None);
            }
        }
    }

    /// Consumes the scan, asserting the delete-hash is empty unless the
    /// scan was broken early or a special-field predicate made residue
    /// expected (§4.7 step 5 / §9's "Deletion-hash lifecycle" note).
    ///
    /// # Errors
    /// Returns [`Error::ScanBroken`] if the hash is non-empty and neither
    /// exception applies — a programming-error signal that a tombstone
    /// escaped the scan unpaired.
    pub fn finish(self) -> Result<()> {
        if self.delete_hash.is_empty() || self.interrupted || self.force_save {
            Ok(())
        } else {
            Err(Error::ScanBroken)
        }
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<BlockOffset>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.indexed_done {
            match self.next_indexed() {
                Ok(Some(pos)) => return Some(Ok(pos)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        match self.next_slop() {
            Ok(Some(pos)) => Some(Ok(pos)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

fn positions_equal(a: IndexRef, b: IndexRef) -> bool {
    a.raw() == b.raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IndexMapCache;
    use crate::comparator::OperatorClass;
    use crate::constants::WINDOW_SIZE;
    use crate::element::Element;
    use crate::mutator::insert;
    use crate::table_iface::{RecordFingerprint, RecordHeader, RECORD_FLAG_DELETE};
    use std::sync::Arc;
    use test_log::test;

    struct Record {
        value: Vec<u8>,
        flags: u16,
        hash: u64,
    }

    struct FakeTable {
        records: Vec<Record>,
    }

    #[allow(clippy::indexing_slicing)]
    impl DataTable for FakeTable {
        fn first_block(&self) -> BlockOffset {
            BlockOffset(1)
        }
        fn next_block(&self, _bh: BlockOffset, off: BlockOffset) -> Option<BlockOffset> {
            let next = off.0 + 1;
            (next < self.records.len() as u64 + 1).then_some(BlockOffset(next))
        }
        fn append(&self) -> BlockOffset {
            BlockOffset(self.records.len() as u64 + 1)
        }
        fn read_record(&self, pos: BlockOffset) -> Result<RecordHeader> {
            let rec = &self.records[(pos.0 - 1) as usize];
            Ok(RecordHeader {
                timestamp: pos.0,
                flags: rec.flags,
                vtable_id: 1,
                hash: rec.hash,
                size: rec.value.len() as u32,
            })
        }
        fn column_value(&self, pos: BlockOffset, _col: u32) -> Result<Vec<u8>> {
            Ok(self.records[(pos.0 - 1) as usize].value.clone())
        }
        fn fingerprint(&self, pos: BlockOffset) -> Result<RecordFingerprint> {
            let rec = &self.records[(pos.0 - 1) as usize];
            Ok(RecordFingerprint {
                hash: rec.hash,
                size: rec.value.len() as u32,
                data_tail: rec.value.clone(),
            })
        }
        fn generation(&self) -> u64 {
            1
        }
    }

    fn new_index() -> Index {
        let table = FakeTable { records: vec![] };
        let cache = Arc::new(IndexMapCache::new(4));
        Index::open_temporary(1, 0, OperatorClass::Eq, cache, WINDOW_SIZE, &table).unwrap()
    }

    #[test]
    fn matched_insert_delete_pair_cancels() {
        let table = FakeTable {
            records: vec![
                Record { value: b"dup".to_vec(), flags: 0, hash: 42 },
                Record { value: b"dup".to_vec(), flags: RECORD_FLAG_DELETE, hash: 42 },
            ],
        };
        let index = new_index();
        for (i, _) in table.records.iter().enumerate() {
            insert(&index, Element::new(BlockOffset(i as u64 + 1), b"dup")).unwrap();
        }
        index.set_tab_append(table.append()).unwrap();

        let range = set_range(&index, &table, None, 0, true, &StopSignal::default(), &mut || {}).unwrap();
        let mut scan = RangeScan::new(&index, &table, 0, None, &range).unwrap();
        let results: Vec<BlockOffset> = (&mut scan).filter_map(|r| r.ok()).collect();
        assert!(results.is_empty());
        assert_eq!(scan.delete_hash_len(), 0);
        scan.finish().unwrap();
    }

    #[test]
    fn unpaired_insert_is_returned() {
        let table = FakeTable {
            records: vec![Record { value: b"solo".to_vec(), flags: 0, hash: 7 }],
        };
        let index = new_index();
        insert(&index, Element::new(BlockOffset(1), b"solo")).unwrap();
        index.set_tab_append(table.append()).unwrap();

        let range = set_range(&index, &table, None, 0, true, &StopSignal::default(), &mut || {}).unwrap();
        let scan = RangeScan::new(&index, &table, 0, None, &range).unwrap();
        let results: Vec<BlockOffset> = scan.filter_map(|r| r.ok()).collect();
        assert_eq!(results, vec![BlockOffset(1)]);
    }

    #[test]
    fn force_save_consults_hash_even_on_predicate_failure() {
        // A special-field predicate engages force-save: an insertion that
        // fails the predicate still must call match-and-forget against a
        // matching tombstone, so the pairing isn't left to leak past the
        // scan (§9's asymmetry). Without this, the tombstone would survive
        // `finish()`'s emptiness assertion and falsely report broken state.
        let table = FakeTable {
            records: vec![
                Record { value: b"dup".to_vec(), flags: 0, hash: 99 },
                Record { value: b"dup".to_vec(), flags: RECORD_FLAG_DELETE, hash: 99 },
            ],
        };
        let index = new_index();
        for (i, _) in table.records.iter().enumerate() {
            insert(&index, Element::new(BlockOffset(i as u64 + 1), b"dup")).unwrap();
        }
        index.set_tab_append(table.append()).unwrap();

        let mut range = set_range(&index, &table, None, 0, true, &StopSignal::default(), &mut || {}).unwrap();
        // simulate a special-field predicate having been in play for setup,
        // independent of the predicate passed to the scan itself below.
        range.force_save = true;

        let predicate = Some((&b"nomatch"[..], Relation::Eq));
        let mut scan = RangeScan::new(&index, &table, 0, predicate, &range).unwrap();
        let results: Vec<BlockOffset> = (&mut scan).filter_map(|r| r.ok()).collect();
        assert!(results.is_empty(), "predicate-failing insertion must not be yielded");
        assert_eq!(
            scan.delete_hash_len(),
            0,
            "force-save must still pair the tombstone against the failing insertion"
        );
        scan.finish().unwrap();
    }

    #[test]
    fn equality_range_setup_narrows_to_matching_keys() {
        let index = new_index();
        for (key, ro) in [("apple", 1u64), ("banana", 2), ("cherry", 3)] {
            insert(&index, Element::new(BlockOffset(ro), key.as_bytes())).unwrap();
        }
        let table = FakeTable { records: vec![] };
        let range = set_range(&index, &table, Some((b"banana", Relation::Eq)), 0, true, &StopSignal::default(), &mut || {}).unwrap();
        assert!(range.beg.is_some());
        assert!(range.end.is_some());
    }

    #[test]
    fn equality_range_setup_empty_for_missing_key() {
        let index = new_index();
        insert(&index, Element::new(BlockOffset(1), b"apple")).unwrap();
        let table = FakeTable { records: vec![] };
        let range = set_range(&index, &table, Some((b"zzz", Relation::Eq)), 0, true, &StopSignal::default(), &mut || {}).unwrap();
        assert!(range.beg.is_none());
        assert!(range.end.is_none());
    }
}
