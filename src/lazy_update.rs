// Lazy updater: catches the index up to the data table's append point. See
// `btreeSynchronize`/the catch-up loop implied by `index.c`'s
// `DefaultIndexScanRangeOp1` and §4.8 of SPEC_FULL.md.
//
// `synchronize`/`unsynchronize` themselves live on `Index` (see
// `lifecycle.rs`) because the reference implementation's
// `btreeSynchronize`/`btreeUnSynchronize` likewise operate directly on the
// index handle; this module only drives them at the right points in the
// catch-up loop.

use crate::element::Element;
use crate::error::Result;
use crate::lifecycle::Index;
use crate::mutator::insert;
use crate::offset::BlockOffset;
use crate::stop_signal::StopSignal;
use crate::table_iface::DataTable;

/// Whether the index has fallen far enough behind the table (by more than
/// `slop` bytes) that a catch-up pass should run before a scan proceeds, or
/// the caller otherwise demands a fully synchronized index.
#[must_use]
pub fn needs_catch_up(index: &Index, table: &dyn DataTable, slop: u64, force: bool) -> bool {
    force || index.tab_append().0 + slop < table.append().0
}

/// Indexes every record between `index.tab_append()` and `table.append()`
/// belonging to this index's virtual table, bracketing the work with the
/// SYNCED witness per §4.8/§5. Yields cooperatively after each record via
/// `yield_fn` so catch-up of a large backlog doesn't monopolize the task.
///
/// Only one caller should drive catch-up for a given index at a time; this
/// is enforced by [`Index::write_lock`], which this function holds for its
/// entire duration. Concurrent readers may still proceed against the stale
/// portion of the index — they're expected to have captured their own
/// snapshot boundary (`ti_Append`) before calling this.
///
/// Checks `stop` once per record, the same cadence the teacher's compaction
/// worker polls its own stop signal. If it fires, catch-up stops after
/// persisting whatever progress it made so far and leaves the index
/// unsynchronized — a later call resumes from that point.
///
/// # Errors
/// Propagates I/O, decode, or data-table errors. On `Err`, the index may be
/// left unsynchronized; a later call to this function will still make
/// forward progress from the partially-advanced `tab_append`.
pub fn catch_up(
    index: &Index,
    table: &dyn DataTable,
    stop: &StopSignal,
    yield_fn: &mut dyn FnMut(),
) -> Result<()> {
    let _guard = index.write_lock();

    index.unsynchronize()?;

    let bh = table.first_block();
    let mut pos = index.tab_append();
    if pos.0 == 0 {
        pos = bh;
    }
    let append = table.append();

    while pos.0 < append.0 {
        if stop.is_stopped() {
            index.set_tab_append(pos)?;
            return Ok(());
        }

        let header = table.read_record(pos)?;
        if header.vtable_id == index.vtable_id() {
            let value = table.column_value(pos, index.col_id())?;
            let elm = Element::new(pos, &value).with_deleted(header.is_tombstone());
            insert(index, elm)?;
        }

        yield_fn();

        match table.next_block(bh, pos) {
            Some(next) if next.0 < append.0 => pos = next,
            _ => break,
        }
    }

    index.set_tab_append(append)?;
    index.synchronize()
}

/// Convenience wrapper around [`catch_up`] that never yields or checks for
/// cancellation; suitable for tests and for small tables where cooperative
/// scheduling doesn't matter.
///
/// # Errors
/// See [`catch_up`].
pub fn catch_up_blocking(index: &Index, table: &dyn DataTable) -> Result<()> {
    catch_up(index, table, &StopSignal::default(), &mut || {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IndexMapCache;
    use crate::comparator::OperatorClass;
    use crate::constants::WINDOW_SIZE;
    use crate::table_iface::{RecordFingerprint, RecordHeader, RECORD_FLAG_DELETE};
    use std::sync::Arc;
    use test_log::test;

    struct Record {
        vtable_id: u32,
        value: Vec<u8>,
        flags: u16,
    }

    struct FakeTable {
        records: Vec<Record>,
        vtable_id: u32,
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
                vtable_id: rec.vtable_id,
                hash: pos.0,
                size: rec.value.len() as u32,
            })
        }
        fn column_value(&self, pos: BlockOffset, _col: u32) -> Result<Vec<u8>> {
            Ok(self.records[(pos.0 - 1) as usize].value.clone())
        }
        fn fingerprint(&self, pos: BlockOffset) -> Result<RecordFingerprint> {
            let rec = &self.records[(pos.0 - 1) as usize];
            Ok(RecordFingerprint {
                hash: pos.0,
                size: rec.value.len() as u32,
                data_tail: rec.value.clone(),
            })
        }
        fn generation(&self) -> u64 {
            1
        }
    }

    fn new_index(table: &FakeTable) -> Index {
        let cache = Arc::new(IndexMapCache::new(4));
        Index::open_temporary(table.vtable_id, 0, OperatorClass::Eq, cache, WINDOW_SIZE, table).unwrap()
    }

    #[test]
    fn catch_up_indexes_only_matching_vtable_and_advances_append() {
        let table = FakeTable {
            vtable_id: 1,
            records: vec![
                Record { vtable_id: 1, value: b"b".to_vec(), flags: 0 },
                Record { vtable_id: 2, value: b"x".to_vec(), flags: 0 },
                Record { vtable_id: 1, value: b"a".to_vec(), flags: 0 },
            ],
        };
        let index = new_index(&table);
        catch_up_blocking(&index, &table).unwrap();

        assert_eq!(index.tab_append(), table.append());
        assert!(index.header().is_synced());

        let got = crate::bounds::forward_bound(&index, b"a", OperatorClass::Eq)
            .unwrap()
            .unwrap();
        let (key, ro) = crate::bounds::resolve(&index, got.pos).unwrap();
        assert_eq!(key, b"a");
        assert_eq!(ro, BlockOffset(3));
    }

    #[test]
    fn catch_up_preserves_tombstone_flag() {
        let table = FakeTable {
            vtable_id: 1,
            records: vec![Record {
                vtable_id: 1,
                value: b"dup".to_vec(),
                flags: RECORD_FLAG_DELETE,
            }],
        };
        let index = new_index(&table);
        catch_up_blocking(&index, &table).unwrap();

        let got = crate::bounds::forward_bound(&index, b"dup", OperatorClass::Eq)
            .unwrap()
            .unwrap();
        let mut fast = crate::cache::FastSlot::new();
        let (node_off, slot) = got.pos.decompose();
        let node = index.read_node(node_off, &mut fast).unwrap();
        assert!(node.elements()[slot].is_deleted());
    }

    #[test]
    fn needs_catch_up_respects_slop() {
        let table = FakeTable {
            vtable_id: 1,
            records: (0..10)
                .map(|i| Record { vtable_id: 1, value: vec![i], flags: 0 })
                .collect(),
        };
        let index = new_index(&table);
        assert!(!needs_catch_up(&index, &table, 100, false));
        assert!(needs_catch_up(&index, &table, 0, false));
        assert!(needs_catch_up(&index, &table, 100, true));
    }
}
