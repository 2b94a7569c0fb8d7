// Index configuration: the public entry point for opening or creating a
// B+tree index. See `OpenBTreeIndex`'s caller-supplied parameters in
// `index.c` and §3/§6 of SPEC_FULL.md.

use crate::cache::IndexMapCache;
use crate::comparator::OperatorClass;
use crate::constants::{DEFAULT_SLOP, WINDOW_SIZE};
use crate::error::Result;
use crate::lifecycle::Index;
use crate::table_iface::DataTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default byte budget for the process-wide index-map cache shared by every
/// index opened through this crate, absent an explicit [`Config::cache`]
/// override. See §3's `MAX_BTREE_CACHE`.
const DEFAULT_CACHE_BYTES: u64 = 16 * 1024 * 1024;

/// Builder for opening a persistent or temporary B+tree index.
///
/// Mirrors the narrow set of knobs `OpenBTreeIndex` actually takes: which
/// virtual table and column this index covers, the key comparator, and the
/// two capacity knobs that are genuinely independent of the fixed on-disk
/// layout (§3's Open Question 2) — `ext_append` chunk size and the shared
/// cache's window budget. `WINDOW_SIZE` itself is not configurable: it's
/// baked into the on-disk format (node offsets are computed relative to it),
/// so changing it per-index would make index files non-portable between
/// opens with different configs.
#[derive(Clone)]
pub struct Config {
    vtable_id: u32,
    col_id: u32,
    op_class: OperatorClass,
    /// How far the index may lag the table's append point before a scan
    /// forces a catch-up pass, absent an explicit `demand_sync`. See §4.7
    /// step 1 and `DEFAULT_SLOP`.
    pub slop: u64,
    /// Granularity `ext_append` advances by when it's extended past the
    /// table's current append point. Defaults to [`WINDOW_SIZE`]; set
    /// larger to amortize `ftruncate`/`fallocate` calls on workloads that
    /// append in large bursts.
    ext_chunk_size: u64,
    /// Shared cache, or a byte budget to build one from on first use.
    cache: CacheSource,
}

#[derive(Clone)]
enum CacheSource {
    Shared(Arc<IndexMapCache>),
    Budget(u64),
}

impl Config {
    /// Starts a new config for an index over `vtable_id`'s `col_id` column,
    /// compared under `op_class`.
    #[must_use]
    pub fn new(vtable_id: u32, col_id: u32, op_class: OperatorClass) -> Self {
        Self {
            vtable_id,
            col_id,
            op_class,
            slop: DEFAULT_SLOP,
            ext_chunk_size: WINDOW_SIZE,
            cache: CacheSource::Budget(DEFAULT_CACHE_BYTES),
        }
    }

    /// Overrides the catch-up slop threshold (§4.7 step 1). Defaults to
    /// [`DEFAULT_SLOP`].
    #[must_use]
    pub fn slop(mut self, bytes: u64) -> Self {
        self.slop = bytes;
        self
    }

    /// Overrides the `ext_append` growth chunk. Defaults to [`WINDOW_SIZE`].
    ///
    /// # Panics
    /// Panics if `bytes` is zero.
    #[must_use]
    pub fn ext_chunk_size(mut self, bytes: u64) -> Self {
        assert!(bytes > 0, "ext_chunk_size must be nonzero");
        self.ext_chunk_size = bytes;
        self
    }

    /// Shares an already-built cache with other indexes in this process,
    /// instead of sizing one from a byte budget.
    #[must_use]
    pub fn use_cache(mut self, cache: Arc<IndexMapCache>) -> Self {
        self.cache = CacheSource::Shared(cache);
        self
    }

    /// Sets the byte budget for this index's cache, used only if no shared
    /// cache is supplied via [`Self::use_cache`]. `MAX_CACHE_WINDOWS` (§3)
    /// is derived as `bytes / WINDOW_SIZE`; the cache's bucket table is then
    /// sized at twice that, per §4.1.
    ///
    /// Defaults to 16 MiB.
    #[must_use]
    pub fn cache_bytes(mut self, bytes: u64) -> Self {
        self.cache = CacheSource::Budget(bytes);
        self
    }

    fn resolve_cache(&self) -> Arc<IndexMapCache> {
        match &self.cache {
            CacheSource::Shared(cache) => cache.clone(),
            CacheSource::Budget(bytes) => {
                let max_windows = (*bytes / WINDOW_SIZE).max(1) as usize;
                Arc::new(IndexMapCache::new(max_windows))
            }
        }
    }

    /// Opens (creating if absent) a persistent index file at `path`.
    ///
    /// # Errors
    /// See [`Index::open`].
    pub fn open<P: AsRef<Path>>(self, path: P, table: &dyn DataTable) -> Result<Index> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let cache = self.resolve_cache();
        Index::open(&path, self.vtable_id, self.col_id, self.op_class, cache, self.ext_chunk_size, table)
    }

    /// Creates a heap-resident temporary index (spills to an anonymous file
    /// once it outgrows [`WINDOW_SIZE`]). See §4.2.
    ///
    /// # Errors
    /// See [`Index::open_temporary`].
    pub fn open_temporary(self, table: &dyn DataTable) -> Result<Index> {
        let cache = self.resolve_cache();
        Index::open_temporary(self.vtable_id, self.col_id, self.op_class, cache, self.ext_chunk_size, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::BlockOffset;
    use crate::table_iface::{RecordFingerprint, RecordHeader};
    use test_log::test;

    struct FakeTable;
    impl DataTable for FakeTable {
        fn first_block(&self) -> BlockOffset {
            BlockOffset(1)
        }
        fn next_block(&self, _bh: BlockOffset, _off: BlockOffset) -> Option<BlockOffset> {
            None
        }
        fn append(&self) -> BlockOffset {
            BlockOffset(1)
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

    #[test]
    fn default_ext_chunk_size_matches_window_size() {
        let table = FakeTable;
        let index = Config::new(1, 0, OperatorClass::Eq).open_temporary(&table).unwrap();
        assert_eq!(index.header().ext_append, BlockOffset(WINDOW_SIZE));
    }

    #[test]
    fn cache_bytes_derives_window_budget() {
        let cfg = Config::new(1, 0, OperatorClass::Eq).cache_bytes(WINDOW_SIZE * 3);
        let cache = cfg.resolve_cache();
        assert_eq!(cache.capacity(), 3);
    }

    #[test]
    fn shared_cache_is_reused_across_configs() {
        let cache = Arc::new(IndexMapCache::new(4));
        let table = FakeTable;
        let a = Config::new(1, 0, OperatorClass::Eq).use_cache(cache.clone()).open_temporary(&table).unwrap();
        let b = Config::new(2, 0, OperatorClass::Eq).use_cache(cache.clone()).open_temporary(&table).unwrap();
        assert_eq!(Arc::strong_count(&cache), 3);
        drop(a);
        drop(b);
    }
}
