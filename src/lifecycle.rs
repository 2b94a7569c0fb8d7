// Index lifecycle: open/create/validate/close, node and header I/O. See
// `OpenBTreeIndex`/`CloseBTreeIndex`/`btreeAppend`/`btreeIndexWrite` in
// `btree.c`/`index.c` and §4.4/§6 of SPEC_FULL.md.
//
// Node/header reads go through the process-wide [`crate::cache::IndexMapCache`];
// writes go straight to the backing storage (a real file, or — for a
// temporary index's first window — an in-process heap buffer) and are never
// routed through the cache, because `FileWindowSource` maps windows
// `MAP_SHARED`: a write to the file through the page cache is transparently
// visible through any outstanding read-only mmap over the same pages, so no
// explicit cache invalidation is needed on the write path.

use crate::cache::{new_identity, FastSlot, FileWindowSource, IndexIdentity, IndexMapCache, WindowBytes, WindowSource};
use crate::coding::{Decode, DecodeError, Encode};
use crate::comparator::OperatorClass;
use crate::constants::{round_up_u64, FORMAT_VERSION, NODE_CAP, NODE_SIZE, WINDOW_MASK, WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::header::{self, Header};
use crate::node::Node;
use crate::offset::{BlockOffset, IndexRef};
use crate::table_iface::DataTable;
use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A remembered cursor position alongside the index range it was valid for.
/// The join-cursor-cache check (§4.6) is gated on the *current* header range
/// matching what was recorded here, not merely "same predicate as before".
#[derive(Clone, Copy, Debug)]
pub(crate) struct PosCacheEntry {
    pub pos: IndexRef,
    pub first_elm: IndexRef,
    pub last_elm: IndexRef,
}

enum Storage {
    Persistent {
        #[allow(dead_code)]
        path: PathBuf,
        file: Arc<File>,
    },
    /// Block 0 always lives in `heap`, even once the index has spilled — the
    /// reference implementation never relocates the first cache block out of
    /// memory for a temporary index. Growth past `WINDOW_SIZE` is addressed
    /// into `spill`, an anonymous file created lazily on first use; its
    /// byte 0 corresponds to logical offset `WINDOW_SIZE`.
    Temporary {
        heap: Mutex<Vec<u8>>,
        spill: Mutex<Option<Arc<File>>>,
    },
}

/// A [`WindowSource`] that shifts window offsets down by a fixed amount
/// before delegating to a real file; used to address a temporary index's
/// spill file, whose byte 0 represents logical offset `WINDOW_SIZE`.
struct ShiftedSource {
    inner: FileWindowSource,
    shift: u64,
}

impl ShiftedSource {
    fn new(file: Arc<File>, shift: u64) -> Self {
        Self {
            inner: FileWindowSource::new(file),
            shift,
        }
    }
}

impl WindowSource for ShiftedSource {
    fn map_window(&self, window_offset: u64, len: usize) -> Result<WindowBytes> {
        self.inner.map_window(window_offset - self.shift, len)
    }
}

/// One open B+tree index: the crate's main public handle.
pub struct Index {
    identity: IndexIdentity,
    storage: Storage,
    header: Mutex<Header>,
    cache: Arc<IndexMapCache>,
    op_class: OperatorClass,
    vtable_id: u32,
    col_id: u32,
    ext_chunk_size: u64,
    /// Cooperative per-process mutation lock (§5). Non-reentrant; held for
    /// the duration of an insert/catch-up batch.
    write_lock: Mutex<()>,
    pos_cache: Mutex<Option<PosCacheEntry>>,
}

impl Index {
    #[must_use]
    pub fn identity(&self) -> IndexIdentity {
        self.identity
    }

    #[must_use]
    pub fn op_class(&self) -> OperatorClass {
        self.op_class
    }

    #[must_use]
    pub fn vtable_id(&self) -> u32 {
        self.vtable_id
    }

    #[must_use]
    pub fn col_id(&self) -> u32 {
        self.col_id
    }

    #[must_use]
    pub fn is_temp(&self) -> bool {
        matches!(self.storage, Storage::Temporary { .. })
    }

    /// A snapshot of the current header. `Header` is `Copy`, so this never
    /// borrows the lock past the call.
    #[must_use]
    pub fn header(&self) -> Header {
        *self.header.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.header().generation
    }

    #[must_use]
    pub fn root(&self) -> BlockOffset {
        self.header().root
    }

    #[must_use]
    pub fn first_elm(&self) -> IndexRef {
        self.header().first_elm
    }

    #[must_use]
    pub fn last_elm(&self) -> IndexRef {
        self.header().last_elm
    }

    #[must_use]
    pub fn tab_append(&self) -> BlockOffset {
        self.header().tab_append
    }

    /// Acquires the cooperative per-process write lock for the duration of
    /// one insert or catch-up batch.
    pub fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().expect("lock poisoned")
    }

    pub(crate) fn cached_pos(&self) -> Option<PosCacheEntry> {
        *self.pos_cache.lock().expect("lock poisoned")
    }

    pub(crate) fn set_cached_pos(&self, entry: PosCacheEntry) {
        *self.pos_cache.lock().expect("lock poisoned") = Some(entry);
    }

    fn mutate_header<T>(&self, f: impl FnOnce(&mut Header) -> T) -> Result<T> {
        let mut guard = self.header.lock().expect("lock poisoned");
        let out = f(&mut guard);
        self.persist_header(&guard)?;
        Ok(out)
    }

    pub fn set_root(&self, root: BlockOffset) -> Result<()> {
        self.mutate_header(|h| h.root = root)
    }

    pub fn set_append(&self, append: BlockOffset) -> Result<()> {
        self.mutate_header(|h| h.append = append)
    }

    pub fn set_tab_append(&self, off: BlockOffset) -> Result<()> {
        self.mutate_header(|h| h.tab_append = off)
    }

    fn set_ext_append(&self, off: BlockOffset) -> Result<()> {
        self.mutate_header(|h| h.ext_append = off)
    }

    pub fn set_first_elm(&self, r: IndexRef) -> Result<()> {
        self.mutate_header(|h| h.first_elm = r)
    }

    pub fn set_last_elm(&self, r: IndexRef) -> Result<()> {
        self.mutate_header(|h| h.last_elm = r)
    }

    pub(crate) fn persist_synced_flag(&self, synced: bool) -> Result<()> {
        self.mutate_header(|h| h.set_synced(synced))
    }

    pub(crate) fn fsync(&self) -> Result<()> {
        if let Storage::Persistent { file, .. } = &self.storage {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Marks the index durably consistent: `fsync`, then set the flag, with
    /// no fsync following (§4.8 / Open Question 3). No-op for temporary
    /// indexes and when already synced.
    pub fn synchronize(&self) -> Result<()> {
        if self.is_temp() || self.header().is_synced() {
            return Ok(());
        }
        self.fsync()?;
        self.persist_synced_flag(true)
    }

    /// Marks the index possibly inconsistent ahead of unfsynced mutation:
    /// clear the flag, then `fsync`. No-op for temporary indexes and when
    /// already unsynced.
    pub fn unsynchronize(&self) -> Result<()> {
        if self.is_temp() || !self.header().is_synced() {
            return Ok(());
        }
        self.persist_synced_flag(false)?;
        self.fsync()
    }

    #[allow(clippy::indexing_slicing)]
    fn persist_header(&self, header: &Header) -> Result<()> {
        let bytes = header.encode_into_vec();
        match &self.storage {
            Storage::Temporary { heap, .. } => {
                let mut heap = heap.lock().expect("lock poisoned");
                if heap.len() < bytes.len() {
                    heap.resize(bytes.len(), 0);
                }
                heap[..bytes.len()].copy_from_slice(&bytes);
            }
            Storage::Persistent { file, .. } => write_at(file, 0, &bytes)?,
        }
        Ok(())
    }

    fn spill_file(&self, spill: &Mutex<Option<Arc<File>>>) -> Result<Arc<File>> {
        let mut guard = spill.lock().expect("lock poisoned");
        if let Some(file) = guard.as_ref() {
            return Ok(file.clone());
        }
        let file = Arc::new(tempfile::tempfile().map_err(Error::OpenFailed)?);
        *guard = Some(file.clone());
        Ok(file)
    }

    /// Reads the node containing `off`. `off` is assumed already aligned to
    /// a node's own offset (callers mask out the element slot themselves,
    /// see [`crate::offset::IndexRef::decompose`]).
    pub fn read_node(&self, off: BlockOffset, fast: &mut FastSlot) -> Result<Node> {
        match &self.storage {
            Storage::Temporary { heap, spill } => {
                if off.0 < WINDOW_SIZE {
                    let heap = heap.lock().expect("lock poisoned");
                    return decode_node_at(&heap, off.0 as usize);
                }
                let file = self.spill_file(spill)?;
                let source = ShiftedSource::new(file, WINDOW_SIZE);
                self.read_node_via_cache(off, fast, &source)
            }
            Storage::Persistent { file, .. } => {
                let source = FileWindowSource::new(file.clone());
                self.read_node_via_cache(off, fast, &source)
            }
        }
    }

    fn read_node_via_cache(
        &self,
        off: BlockOffset,
        fast: &mut FastSlot,
        source: &dyn WindowSource,
    ) -> Result<Node> {
        let window = self.cache.get(self.identity, off, NODE_SIZE, fast, source)?;
        let local = (off.0 - window.window_offset()) as usize;
        decode_node_at(window.as_slice(), local)
    }

    /// Overwrites the node at `off` in place. Used for parent-pointer fixups
    /// and in-place insertion; never changes a node's offset.
    #[allow(clippy::indexing_slicing)]
    pub fn write_node(&self, off: BlockOffset, node: &Node) -> Result<()> {
        let bytes = node.encode_into_vec();
        match &self.storage {
            Storage::Temporary { heap, spill } => {
                if off.0 < WINDOW_SIZE {
                    let mut heap = heap.lock().expect("lock poisoned");
                    let end = off.0 as usize + bytes.len();
                    if heap.len() < end {
                        heap.resize(end, 0);
                    }
                    heap[off.0 as usize..end].copy_from_slice(&bytes);
                    return Ok(());
                }
                let file = self.spill_file(spill)?;
                write_at(&file, off.0 - WINDOW_SIZE, &bytes)
            }
            Storage::Persistent { file, .. } => write_at(file, off.0, &bytes),
        }
    }

    /// Rewrites `child_off`'s parent back-pointer to `(parent_off, slot)`.
    fn rewrite_child_parent(
        &self,
        child_off: BlockOffset,
        parent_off: BlockOffset,
        slot: usize,
        fast: &mut FastSlot,
    ) -> Result<()> {
        let mut child = self.read_node(child_off, fast)?;
        child.set_parent_slot(parent_off, slot);
        self.write_node(child_off, &child)
    }

    /// Allocates space for, writes, and returns the offset of a brand-new
    /// node, reproducing `btreeAppend`'s alignment exactly: round the append
    /// cursor up to a [`NODE_CAP`]-byte boundary, then — only if the node's
    /// span would straddle a cache-window boundary from there — round up
    /// again to the window boundary. Internal nodes have every child's
    /// parent back-pointer rewritten to point here.
    pub fn append_node(&self, node: &Node) -> Result<BlockOffset> {
        let append = self.header().append;
        let mut bnro = round_up_u64(append.0, NODE_CAP as u64);
        let span_last_byte = bnro + NODE_SIZE as u64 - 1;
        if (bnro ^ span_last_byte) & !WINDOW_MASK != 0 {
            bnro = round_up_u64(bnro, WINDOW_SIZE);
        }
        let end = bnro + NODE_SIZE as u64;

        self.ensure_capacity(BlockOffset(end))?;
        self.write_node(BlockOffset(bnro), node)?;

        if !node.is_leaf() {
            let mut fast = FastSlot::new();
            for (slot, elm) in node.elements().iter().enumerate() {
                debug_assert!(elm.ro.0 != 0, "internal element must reference a child");
                self.rewrite_child_parent(elm.ro, BlockOffset(bnro), slot, &mut fast)?;
            }
        }

        self.set_append(BlockOffset(end))?;
        Ok(BlockOffset(bnro))
    }

    /// Extends the backing storage with zero bytes, in `ext_chunk_size`
    /// increments, until it covers `upto`. No-op if already large enough.
    fn ensure_capacity(&self, upto: BlockOffset) -> Result<()> {
        let ext_append = self.header().ext_append.0;
        if upto.0 <= ext_append {
            return Ok(());
        }
        let chunk = self.ext_chunk_size.max(1);
        let target = ext_append + round_up_u64(upto.0 - ext_append, chunk);

        match &self.storage {
            Storage::Temporary { heap, spill } => {
                if target <= WINDOW_SIZE {
                    let mut heap = heap.lock().expect("lock poisoned");
                    heap.resize(target as usize, 0);
                } else {
                    let file = self.spill_file(spill)?;
                    let spill_start = ext_append.saturating_sub(WINDOW_SIZE);
                    let spill_target = target - WINDOW_SIZE;
                    zero_extend(&file, spill_start, spill_target - spill_start)?;
                    if ext_append < WINDOW_SIZE {
                        let mut heap = heap.lock().expect("lock poisoned");
                        heap.resize(WINDOW_SIZE as usize, 0);
                    }
                }
            }
            Storage::Persistent { file, .. } => {
                zero_extend(file, ext_append, target - ext_append)?;
            }
        }

        self.set_ext_append(BlockOffset(target))
    }

    /// Opens an existing persistent index, or creates and two-phase
    /// initializes one if absent/invalid. See §6.
    ///
    /// # Errors
    /// Returns [`Error::OpenFailed`] if the file cannot be opened or locked,
    /// [`Error::CorruptHeader`] is never returned here (corruption instead
    /// triggers a rebuild), and any I/O error encountered while extending or
    /// writing the file.
    pub fn open(
        path: &Path,
        vtable_id: u32,
        col_id: u32,
        op_class: OperatorClass,
        cache: Arc<IndexMapCache>,
        ext_chunk_size: u64,
        table: &dyn DataTable,
    ) -> Result<Self> {
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(Error::OpenFailed)?,
        );

        let header = match Self::try_fast_path(&file, table)? {
            Some(h) => h,
            None => {
                file.lock_exclusive().map_err(Error::OpenFailed)?;
                let header = match Self::read_header_if_valid(&file, table.generation())? {
                    Some(h) => h,
                    None => Self::rebuild(&file, table)?,
                };
                fs2::FileExt::unlock(file.as_ref()).map_err(Error::OpenFailed)?;
                header
            }
        };

        Ok(Self {
            identity: new_identity(),
            storage: Storage::Persistent {
                path: path.to_path_buf(),
                file,
            },
            header: Mutex::new(header),
            cache,
            op_class,
            vtable_id,
            col_id,
            ext_chunk_size,
            write_lock: Mutex::new(()),
            pos_cache: Mutex::new(None),
        })
    }

    /// Creates an in-memory temporary index: no cross-process identity, no
    /// file on disk unless it spills. Always reports as synced, since a
    /// temporary index never survives a crash to be crash-witnessed against.
    ///
    /// # Errors
    /// Infallible in practice (no I/O on the fast path); returns `Result`
    /// for symmetry with [`Index::open`].
    #[allow(clippy::indexing_slicing)]
    pub fn open_temporary(
        vtable_id: u32,
        col_id: u32,
        op_class: OperatorClass,
        cache: Arc<IndexMapCache>,
        ext_chunk_size: u64,
        table: &dyn DataTable,
    ) -> Result<Self> {
        let head_size = header::ENCODED_SIZE;
        let root = BlockOffset(round_up_u64(u64::from(head_size), NODE_CAP as u64));
        let mut header = Header::new(table.generation(), root, head_size, true);
        header.set_synced(true);
        header.ext_append = BlockOffset(WINDOW_SIZE);
        header.tab_append = table.first_block();

        let mut heap = vec![0u8; WINDOW_SIZE as usize];
        let header_bytes = header.encode_into_vec();
        heap[..header_bytes.len()].copy_from_slice(&header_bytes);
        let leaf_bytes = Node::new(true).encode_into_vec();
        let root_off = root.0 as usize;
        heap[root_off..root_off + leaf_bytes.len()].copy_from_slice(&leaf_bytes);

        Ok(Self {
            identity: new_identity(),
            storage: Storage::Temporary {
                heap: Mutex::new(heap),
                spill: Mutex::new(None),
            },
            header: Mutex::new(header),
            cache,
            op_class,
            vtable_id,
            col_id,
            ext_chunk_size,
            write_lock: Mutex::new(()),
            pos_cache: Mutex::new(None),
        })
    }

    fn try_fast_path(file: &File, table: &dyn DataTable) -> Result<Option<Header>> {
        file.lock_shared().map_err(Error::OpenFailed)?;
        let result = Self::read_header_if_valid(file, table.generation());
        fs2::FileExt::unlock(file).map_err(Error::OpenFailed)?;
        result
    }

    #[allow(clippy::indexing_slicing)]
    fn read_header_if_valid(file: &File, generation: u64) -> Result<Option<Header>> {
        let len = file.metadata()?.len();
        if len < u64::from(header::ENCODED_SIZE) {
            return Ok(None);
        }
        let mut buf = vec![0u8; header::ENCODED_SIZE as usize];
        if read_at(file, 0, &mut buf).is_err() {
            return Ok(None);
        }
        let Ok(header) = Header::decode_from(&mut &buf[..]) else {
            return Ok(None);
        };
        if header.validate_format().is_err() {
            return Ok(None);
        }
        if header.version == 0 {
            // mid-construction: another writer's two-phase create hasn't
            // activated yet.
            return Ok(None);
        }
        if !header.is_synced() {
            // crash witness: the index was unsynchronized and never
            // re-synchronized, so it may be structurally inconsistent.
            return Ok(None);
        }
        if header.generation != generation {
            return Ok(None);
        }
        Ok(Some(header))
    }

    /// Two-phase create: write the full header (`version = 0`, `tab_append`
    /// at the table's first block, unsynced) plus an empty root leaf,
    /// `fsync`, then activate by rewriting `version` alone. The index starts
    /// unsynced: it has indexed nothing yet (`tab_append == table.first_block()`),
    /// so it only earns `SYNCED` once a catch-up pass indexes up to the
    /// table's append point and fsyncs (`lazy_update`'s job), mirroring
    /// `OpenBTreeIndex`/`btreeSynchronize` exactly rather than marking a
    /// freshly built but not-yet-caught-up index synced.
    fn rebuild(file: &File, table: &dyn DataTable) -> Result<Header> {
        file.set_len(0).map_err(Error::ExtendFailed)?;
        file.set_len(WINDOW_SIZE).map_err(Error::ExtendFailed)?;

        let head_size = header::ENCODED_SIZE;
        let root = BlockOffset(round_up_u64(u64::from(head_size), NODE_CAP as u64));
        let mut header = Header::new(table.generation(), root, head_size, false);
        header.ext_append = BlockOffset(WINDOW_SIZE);
        header.tab_append = table.first_block();

        write_at(file, 0, &header.encode_into_vec())?;
        write_at(file, root.0, &Node::new(true).encode_into_vec())?;
        file.sync_all()?;

        header.version = FORMAT_VERSION;
        write_at(file, 4, &header.version.to_le_bytes())?;
        file.sync_all()?;

        Ok(header)
    }

    /// Force-evicts this index's cache entries, synchronizes it under an
    /// exclusive lock (skipped for temporary indexes), and releases the
    /// backing file. See §6 item 3.
    ///
    /// # Errors
    /// Returns an error if the final `fsync` or header rewrite fails.
    pub fn close(self) -> Result<()> {
        self.cache.drop_index(self.identity);
        if let Storage::Persistent { file, .. } = &self.storage {
            file.lock_exclusive().map_err(Error::OpenFailed)?;
            self.synchronize()?;
            fs2::FileExt::unlock(file.as_ref()).map_err(Error::OpenFailed)?;
        }
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.cache.drop_index(self.identity);
    }
}

#[allow(clippy::indexing_slicing)]
fn decode_node_at(bytes: &[u8], local_off: usize) -> Result<Node> {
    let end = local_off + NODE_SIZE;
    if end > bytes.len() {
        return Err(Error::Decode(DecodeError::InvalidLength(bytes.len())));
    }
    Ok(Node::decode_from(&mut &bytes[local_off..end])?)
}

#[allow(clippy::indexing_slicing)]
fn zero_extend(file: &File, start: u64, len: u64) -> Result<()> {
    const CHUNK: usize = 8192;
    let zeros = [0u8; CHUNK];
    let mut off = start;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        write_at(file, off, &zeros[..n])?;
        off += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_at(data, offset)?;
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

// Positional I/O fallback for non-Unix targets. Not safe under concurrent
// access from multiple threads (seek+read/write is not atomic); a real
// Windows port would use `seek_read`/`seek_write`. Recorded as a platform
// gap in `DESIGN.md`, consistent with the teacher's own Unix-only
// `fsync_directory`.
#[cfg(not(unix))]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_iface::{RecordFingerprint, RecordHeader};
    use test_log::test;

    struct FakeTable {
        generation: u64,
    }

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
            unimplemented!("not needed for lifecycle tests")
        }
        fn column_value(&self, _pos: BlockOffset, _col: u32) -> Result<Vec<u8>> {
            unimplemented!("not needed for lifecycle tests")
        }
        fn fingerprint(&self, _pos: BlockOffset) -> Result<RecordFingerprint> {
            unimplemented!("not needed for lifecycle tests")
        }
        fn generation(&self) -> u64 {
            self.generation
        }
    }

    #[test]
    fn create_then_reopen_preserves_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bti");
        let table = FakeTable { generation: 7 };
        let cache = Arc::new(IndexMapCache::new(4));

        let idx = Index::open(&path, 1, 2, OperatorClass::Eq, cache.clone(), WINDOW_SIZE, &table).unwrap();
        assert_eq!(idx.generation(), 7);
        // freshly created: hasn't indexed anything yet, not SYNCED until a
        // catch-up pass runs and `close()`/`synchronize()` commits it.
        assert!(!idx.header().is_synced());
        let root = idx.root();
        let mut fast = FastSlot::new();
        let node = idx.read_node(root, &mut fast).unwrap();
        assert!(node.is_leaf());
        idx.close().unwrap();

        let idx2 = Index::open(&path, 1, 2, OperatorClass::Eq, cache, WINDOW_SIZE, &table).unwrap();
        assert_eq!(idx2.generation(), 7);
        assert_eq!(idx2.root(), root);
    }

    #[test]
    fn generation_mismatch_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bti");
        let cache = Arc::new(IndexMapCache::new(4));

        let idx = Index::open(&path, 1, 2, OperatorClass::Eq, cache.clone(), WINDOW_SIZE, &FakeTable { generation: 1 }).unwrap();
        idx.close().unwrap();

        let idx2 = Index::open(&path, 1, 2, OperatorClass::Eq, cache, WINDOW_SIZE, &FakeTable { generation: 2 }).unwrap();
        assert_eq!(idx2.generation(), 2);
    }

    #[test]
    fn append_node_never_straddles_a_window() {
        let table = FakeTable { generation: 1 };
        let cache = Arc::new(IndexMapCache::new(4));
        let idx = Index::open_temporary(1, 2, OperatorClass::Eq, cache, WINDOW_SIZE, &table).unwrap();

        let mut last_off = idx.root();
        for _ in 0..200 {
            let off = idx.append_node(&Node::new(true)).unwrap();
            let window_of = |o: u64| o & !WINDOW_MASK;
            assert_eq!(
                window_of(off.0),
                window_of(off.0 + NODE_SIZE as u64 - 1),
                "node at {off} straddles a window boundary"
            );
            last_off = off;
        }
        assert!(last_off.0 > idx.root().0);
    }

    #[test]
    fn unsynchronize_then_synchronize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bti");
        let table = FakeTable { generation: 1 };
        let cache = Arc::new(IndexMapCache::new(4));
        let idx = Index::open(&path, 1, 2, OperatorClass::Eq, cache, WINDOW_SIZE, &table).unwrap();

        // freshly created: not yet synced. unsynchronize() on an already
        // unsynced index is a no-op guard, so synchronize() first to reach
        // a known synced baseline before exercising the round trip.
        assert!(!idx.header().is_synced());
        idx.synchronize().unwrap();
        assert!(idx.header().is_synced());
        idx.unsynchronize().unwrap();
        assert!(!idx.header().is_synced());
        idx.synchronize().unwrap();
        assert!(idx.header().is_synced());
    }

    #[test]
    fn temporary_index_spills_to_an_unlinked_file_past_one_window() {
        use crate::element::Element;
        use crate::mutator::insert;
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt as _;

        let table = FakeTable { generation: 1 };
        let cache = Arc::new(IndexMapCache::new(8));
        let idx = Index::open_temporary(1, 2, OperatorClass::Eq, cache, WINDOW_SIZE, &table).unwrap();

        let n = 20_000u64;
        for i in 0..n {
            let key = format!("key_{i:05}");
            insert(&idx, Element::new(BlockOffset(i + 1), key.as_bytes())).unwrap();
        }

        let spilled = match &idx.storage {
            Storage::Temporary { spill, .. } => spill.lock().expect("lock poisoned").clone(),
            Storage::Persistent { .. } => None,
        };
        let file = spilled.expect("20,000 elements must outgrow one window and spill");
        #[cfg(unix)]
        assert_eq!(
            file.metadata().unwrap().nlink(),
            0,
            "spill file must be unlinked on creation"
        );

        let mut fast = FastSlot::new();
        fn walk(idx: &Index, off: BlockOffset, fast: &mut FastSlot, out: &mut Vec<u64>) {
            let node = idx.read_node(off, fast).unwrap();
            if node.is_leaf() {
                out.extend(node.elements().iter().map(|e| e.ro.0));
            } else {
                for e in node.elements() {
                    walk(idx, e.ro, fast, out);
                }
            }
        }
        let mut ros = Vec::new();
        walk(&idx, idx.root(), &mut fast, &mut ros);
        ros.sort_unstable();
        let expected: Vec<u64> = (0..n).map(|i| i + 1).collect();
        assert_eq!(ros, expected, "every inserted record must remain retrievable after spilling");
    }
}
