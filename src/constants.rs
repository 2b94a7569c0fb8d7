// Layout constants for the on-disk B+tree index format.
//
// Values are chosen to match the reference implementation's defaults
// (see `btree.h`'s `BT_MAXELM`/`BT_DATALEN`/`BT_CACHESIZE`/`BT_SLOP`) rather
// than invented from scratch, so that the split/append/eviction arithmetic
// below lines up with well-understood fan-out and slop behavior.

/// Elements held per tree node.
pub const NODE_CAP: usize = 64;

/// Bytes of key prefix cached inside each element.
pub const PREFIX_LEN: usize = 8;

/// Mask used to extract a node-local element index from a leaf offset.
pub const INDEX_MASK: u64 = (NODE_CAP as u64) - 1;

/// Size, in bytes, of one index-map cache window.
pub const WINDOW_SIZE: u64 = 64 * 1024;

/// Mask used to compute a window-aligned offset.
pub const WINDOW_MASK: u64 = WINDOW_SIZE - 1;

/// Default slop: how far the index may lag the table before catch-up runs.
pub const DEFAULT_SLOP: u64 = 1024;

/// On-disk magic identifying a B+tree index file.
pub const MAGIC: u32 = 0x4255_FCD2;

/// On-disk format version.
pub const FORMAT_VERSION: u16 = 2;

/// Header flag: the index is durably consistent with its own append point.
pub const FLAG_SYNCED: u16 = 0x0001;

/// Header flag: the index is memory-backed and has no cross-process identity.
pub const FLAG_TEMP: u16 = 0x0002;

/// Element flag: this leaf element is a tombstone companion (deletion).
pub const ELEMENT_FLAG_DELETED: u16 = 0x0001;

/// Node flag: this node is a leaf.
pub const NODE_FLAG_LEAF: u16 = 0x0001;

/// On-disk byte size of one [`crate::element::Element`].
pub const ELEMENT_SIZE: usize = 8 + 2 + 2 + PREFIX_LEN;

/// On-disk byte size of one [`crate::node::Node`] (uncompressed, unpadded).
pub const NODE_SIZE: usize = 8 + 2 + 2 + NODE_CAP * ELEMENT_SIZE;

/// Half of `NODE_CAP`; the size of each half produced by a split.
pub const SPLIT_HALF: usize = NODE_CAP / 2;

/// Rounds `value` up to the next multiple of `align` (`align` a power of two).
///
/// Used to align a new node's offset to a [`NODE_CAP`]-byte boundary (so its
/// low `log2(NODE_CAP)` address bits are free to encode an element slot, see
/// [`crate::offset::IndexRef`]) and, separately, to align a file-extension
/// size to [`WINDOW_SIZE`]. Nodes are *not* padded to a fixed stride on
/// disk — [`crate::lifecycle::Index::append_node`] packs them back-to-back
/// at their real encoded size, re-aligning only when the next allocation
/// would otherwise straddle a window boundary, mirroring `btreeAppend`.
#[must_use]
pub const fn round_up_u64(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
