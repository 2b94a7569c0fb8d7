// Interface consumed from the data-table (heap) layer. See spec.md §6's
// "Interface consumed from the data-table layer" and §1's scope note that
// the heap/data-file storage itself is an external collaborator — this
// module only names the narrow surface the engine calls through.

use crate::offset::BlockOffset;

/// Flag on a record header: the record is a `DELETE` tombstone.
pub const RECORD_FLAG_DELETE: u16 = 0x0001;

/// Flag on a record header: the record is the deletion half of an `UPDATE`.
pub const RECORD_FLAG_UPDATE_DELETE: u16 = 0x0002;

/// The subset of a data-table record's header the engine needs: enough to
/// decide tombstone-ness, snapshot visibility, and tombstone/insert pairing.
/// Grounded in `RecHead` referenced throughout `btree.c`/`index.c`.
#[derive(Clone, Debug)]
pub struct RecordHeader {
    /// Record creation timestamp, used for snapshot-freeze comparisons.
    pub timestamp: u64,

    /// `RECORD_FLAG_*` bits.
    pub flags: u16,

    /// Virtual-table id this record belongs to within the shared data file.
    pub vtable_id: u32,

    /// Content hash used to pair a tombstone with its original insertion
    /// during a scan (§4.7's delete-hash).
    pub hash: u64,

    /// Byte size of the record's stored value, part of the pairing
    /// fingerprint alongside `hash` and a data tail.
    pub size: u32,
}

impl RecordHeader {
    /// Whether this record is a deletion marker that should be entered into
    /// the scan's delete-hash rather than passed to the downstream filter.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags & (RECORD_FLAG_DELETE | RECORD_FLAG_UPDATE_DELETE) != 0
    }
}

/// A narrow fingerprint used to pair a tombstone with the insertion it
/// cancels: content hash plus enough corroborating detail (`size` and a
/// short data tail) to avoid false-positive pairing on a hash collision.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordFingerprint {
    pub hash: u64,
    pub size: u32,
    pub data_tail: Vec<u8>,
}

/// The narrow interface this crate consumes from the append-only data-table
/// (heap) layer. Implemented by the executor's storage layer; this crate
/// never implements table storage itself (spec.md §1, "Out of scope").
pub trait DataTable {
    /// Offset of the first record in the table.
    fn first_block(&self) -> BlockOffset;

    /// Offset of the record following `off` within block `bh`, or `None` at
    /// the table's append point.
    fn next_block(&self, bh: BlockOffset, off: BlockOffset) -> Option<BlockOffset>;

    /// The table's current append point (monotonically advancing).
    fn append(&self) -> BlockOffset;

    /// Reads the record header at `pos`.
    ///
    /// # Errors
    /// Returns an error if `pos` does not name a valid record.
    fn read_record(&self, pos: BlockOffset) -> crate::Result<RecordHeader>;

    /// Reads the indexed column's raw value bytes for the record at `pos`.
    ///
    /// # Errors
    /// Returns an error if `pos` does not name a valid record.
    fn column_value(&self, pos: BlockOffset, col: u32) -> crate::Result<Vec<u8>>;

    /// Computes this record's pairing fingerprint, used to cancel a
    /// tombstone against the insertion it deletes.
    ///
    /// # Errors
    /// Returns an error if `pos` does not name a valid record.
    fn fingerprint(&self, pos: BlockOffset) -> crate::Result<RecordFingerprint>;

    /// The table's current generation. An index is valid only while its
    /// recorded generation equals this value.
    fn generation(&self) -> u64;
}
