// Index-map cache: a process-wide hashed LRU of fixed-size mmap'd windows
// over index files, with per-window reference counts. See §4.1 of
// SPEC_FULL.md and `btreeGetIndexMap`/`btreeRelIndexMap`/`btreeCachePurge`
// in the reference implementation.
//
// Grounded on the teacher's `descriptor_table/mod.rs` (refcounted resource
// cache, `Drop`-based release) generalized from cached file descriptors to
// cached mmap windows, with eviction redone as a bucket-array CLOCK scan
// (see `IndexMapCache::purge` below) rather than the teacher's `LruList`
// recency list. `memmap2` itself is not used anywhere in the teacher; it's
// sourced from `other_examples/` repos that mmap their own storage files
// (e.g. `vvoss-dev-reedbase`).
#![allow(unsafe_code)]

use crate::constants::WINDOW_SIZE;
use crate::error::{Error, Result};
use crate::offset::BlockOffset;
use memmap2::Mmap;
use rand::Rng;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide, randomized identity for one open index file. Used as the
/// high bits of every cache bucket key so that windows from different
/// indexes don't collide even when their file offsets coincide; mirrors
/// `i_CacheRand` in the reference implementation.
pub type IndexIdentity = u64;

/// Draws a fresh random identity for a newly opened index.
#[must_use]
pub fn new_identity() -> IndexIdentity {
    rand::rng().random()
}

/// The bytes backing one cached window.
enum Backing {
    /// A read-only mmap over a window-aligned region of the index file.
    Mapped(Mmap),

    /// Block 0 of a *temporary* index: aliases the in-process heap header
    /// region directly and is never mmapped/munmapped (§4.1).
    Heap(Arc<[u8]>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => &m[..],
            Self::Heap(v) => v,
        }
    }
}

/// Supplies window bytes for one index file; implemented by the lifecycle
/// layer so the cache itself never needs to know how a window is produced
/// (real `mmap` vs. heap-resident temporary index).
pub trait WindowSource: Send + Sync {
    /// Maps (or otherwise produces) the `len`-byte window starting at the
    /// window-aligned `window_offset`.
    fn map_window(&self, window_offset: u64, len: usize) -> Result<WindowBytes>;
}

/// Bytes for a freshly produced window, handed to the cache to store.
pub enum WindowBytes {
    Mapped(Mmap),
    Heap(Arc<[u8]>),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    index: IndexIdentity,
    window: u64,
}

struct Entry {
    key: CacheKey,
    backing: Backing,
    refcount: AtomicUsize,
}

/// A borrowed view of one cached window. Dropping it releases the
/// reference count; it does not by itself trigger eviction (see
/// [`IndexMapCache::purge`]).
pub struct Window {
    entry: Arc<Entry>,
    cache: Arc<CacheInner>,
}

impl Window {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.entry.backing.as_slice()
    }

    #[must_use]
    pub fn window_offset(&self) -> u64 {
        self.entry.key.window
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        self.entry.refcount.fetch_sub(1, Ordering::AcqRel);
        let _ = &self.cache; // keep the cache alive at least as long as borrows of it
    }
}

/// A caller-retained one-slot fast-path cache, passed by reference across
/// calls so a caller doing repeated accesses to the same window skips the
/// bucket scan entirely. Mirrors the reference implementation's
/// caller-provided fast-path slot ahead of the full hash lookup.
#[derive(Default)]
pub struct FastSlot(Option<(IndexIdentity, u64, Arc<Entry>)>);

impl FastSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self(None)
    }
}

struct CacheInner {
    buckets: Mutex<Vec<Vec<Arc<Entry>>>>,
    purge_cursor: AtomicUsize,
    window_count: AtomicUsize,
    max_windows: usize,
}

impl CacheInner {
    fn bucket_index(&self, key: CacheKey, nbuckets: usize) -> usize {
        // Simple multiplicative mix; the per-index random identity already
        // does the collision-spreading work described in §4.1.
        let mut h = key.index ^ key.window.rotate_left(17);
        h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h as usize) % nbuckets
    }
}

/// Process-wide index-map cache. Owned as a single value (typically behind
/// an `Arc`, one per process) and passed to every open index rather than
/// modeled as ambient global mutable state (see the "global mutable state"
/// design note).
pub struct IndexMapCache {
    inner: Arc<CacheInner>,
}

impl IndexMapCache {
    /// `max_windows` is `MAX_CACHE_WINDOWS`; the bucket table is sized
    /// `2 * max_windows` per §4.1 (`BTREE_HSIZE`).
    #[must_use]
    pub fn new(max_windows: usize) -> Self {
        let nbuckets = (max_windows * 2).max(1);
        Self {
            inner: Arc::new(CacheInner {
                buckets: Mutex::new((0..nbuckets).map(|_| Vec::new()).collect()),
                purge_cursor: AtomicUsize::new(0),
                window_count: AtomicUsize::new(0),
                max_windows,
            }),
        }
    }

    /// `MAX_CACHE_WINDOWS` this cache was built with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.max_windows
    }

    /// Looks up or creates the window covering `offset`, which must not
    /// straddle a window boundary (callers pre-validate this, per §4.1's
    /// failure semantics).
    #[allow(clippy::indexing_slicing)]
    pub fn get(
        &self,
        index: IndexIdentity,
        offset: BlockOffset,
        need_bytes: usize,
        fast: &mut FastSlot,
        source: &dyn WindowSource,
    ) -> Result<Window> {
        let window_start = offset.window_start().0;
        debug_assert!(
            offset.0 + need_bytes as u64 <= window_start + WINDOW_SIZE,
            "request crosses a window boundary"
        );
        let key = CacheKey {
            index,
            window: window_start,
        };

        if let Some((idx, win, entry)) = &fast.0 {
            if *idx == index && *win == window_start {
                entry.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(Window {
                    entry: entry.clone(),
                    cache: self.inner.clone(),
                });
            }
        }

        let nbuckets = self.inner.buckets.lock().expect("lock poisoned").len();
        let bucket = self.inner.bucket_index(key, nbuckets);

        {
            let buckets = self.inner.buckets.lock().expect("lock poisoned");
            if let Some(entry) = buckets[bucket].iter().find(|e| e.key == key) {
                entry.refcount.fetch_add(1, Ordering::AcqRel);
                let entry = entry.clone();
                fast.0 = Some((index, window_start, entry.clone()));
                return Ok(Window {
                    entry,
                    cache: self.inner.clone(),
                });
            }
        }

        // Miss: produce the window and insert at bucket head.
        let window_len = WINDOW_SIZE.min(u64::MAX - window_start) as usize;
        let bytes = source.map_window(window_start, window_len)?;
        let backing = match bytes {
            WindowBytes::Mapped(m) => Backing::Mapped(m),
            WindowBytes::Heap(h) => Backing::Heap(h),
        };
        let entry = Arc::new(Entry {
            key,
            backing,
            refcount: AtomicUsize::new(1),
        });

        {
            let mut buckets = self.inner.buckets.lock().expect("lock poisoned");
            buckets[bucket].push(entry.clone());
        }
        self.inner.window_count.fetch_add(1, Ordering::AcqRel);
        fast.0 = Some((index, window_start, entry.clone()));

        if self.inner.window_count.load(Ordering::Acquire) > self.inner.max_windows {
            self.purge();
        }

        Ok(Window {
            entry,
            cache: self.inner.clone(),
        })
    }

    /// Approximate-CLOCK eviction: scan `WINDOW_SIZE/16` buckets from a
    /// monotonically-advancing global cursor, evicting every zero-refcount
    /// entry found in each visited bucket (not merely the first).
    ///
    /// The reference implementation advances its purge cursor *downward*;
    /// this crate advances upward instead, which is behaviorally
    /// equivalent over an unordered bucket array (recorded as a harmless
    /// deviation in `DESIGN.md`).
    #[allow(clippy::indexing_slicing)]
    pub fn purge(&self) {
        let mut buckets = self.inner.buckets.lock().expect("lock poisoned");
        let nbuckets = buckets.len();
        if nbuckets == 0 {
            return;
        }
        let scan_count = ((WINDOW_SIZE / 16) as usize).max(1).min(nbuckets);
        for _ in 0..scan_count {
            let i = self.inner.purge_cursor.fetch_add(1, Ordering::AcqRel) % nbuckets;
            let before = buckets[i].len();
            buckets[i].retain(|e| e.refcount.load(Ordering::Acquire) != 0);
            let evicted = before - buckets[i].len();
            if evicted > 0 {
                self.inner
                    .window_count
                    .fetch_sub(evicted, Ordering::AcqRel);
            }
        }
    }

    /// Forces every window belonging to `index` out of the cache,
    /// regardless of refcount. Used by `close()` to guarantee no stale
    /// mapping outlives the file descriptor it was mapped from.
    ///
    /// # Panics
    /// Panics (as a programming-error assertion, not a recoverable `Error`)
    /// if a window is still referenced by a live [`Window`] borrow when
    /// this is called; callers must drop all borrows before closing.
    pub fn drop_index(&self, index: IndexIdentity) {
        let mut buckets = self.inner.buckets.lock().expect("lock poisoned");
        let mut dropped = 0usize;
        for bucket in buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|e| {
                if e.key.index != index {
                    return true;
                }
                assert_eq!(
                    e.refcount.load(Ordering::Acquire),
                    0,
                    "closing index with an outstanding window borrow"
                );
                false
            });
            dropped += before - bucket.len();
        }
        self.inner
            .window_count
            .fetch_sub(dropped, Ordering::AcqRel);
    }
}

/// A [`WindowSource`] backed by a real file descriptor, used by persistent
/// indexes once they've grown past the in-memory header region.
pub struct FileWindowSource {
    file: Arc<File>,
}

impl FileWindowSource {
    #[must_use]
    pub fn new(file: Arc<File>) -> Self {
        Self { file }
    }
}

impl WindowSource for FileWindowSource {
    fn map_window(&self, window_offset: u64, len: usize) -> Result<WindowBytes> {
        // SAFETY: the mapped region is read-only and shared; concurrent
        // writers to the underlying file are serialized by the index's
        // cooperative write lock (§5), so no other in-process writer can
        // race this mapping. Cross-process writers are excluded by the
        // advisory file-range lock taken around mutation.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(window_offset)
                .len(len)
                .map(self.file.as_ref())
        }
        .map_err(Error::MapFailed)?;
        Ok(WindowBytes::Mapped(mmap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HeapSource(Arc<[u8]>);
    impl WindowSource for HeapSource {
        fn map_window(&self, _window_offset: u64, _len: usize) -> Result<WindowBytes> {
            Ok(WindowBytes::Heap(self.0.clone()))
        }
    }

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn get_hits_fast_slot_on_repeat_access() {
        let cache = IndexMapCache::new(4);
        let source = HeapSource(Arc::from(vec![7u8; WINDOW_SIZE as usize]));
        let mut fast = FastSlot::new();
        let idx = new_identity();

        let w1 = cache.get(idx, BlockOffset(0), 8, &mut fast, &source).unwrap();
        assert_eq!(w1.as_slice()[0], 7);
        drop(w1);

        let w2 = cache.get(idx, BlockOffset(4), 8, &mut fast, &source).unwrap();
        assert_eq!(w2.window_offset(), 0);
    }

    #[test]
    fn purge_evicts_only_unreferenced_entries() {
        let cache = IndexMapCache::new(1);
        let source = HeapSource(Arc::from(vec![0u8; WINDOW_SIZE as usize]));
        let mut fast = FastSlot::new();
        let idx = new_identity();

        let held = cache
            .get(idx, BlockOffset(0), 8, &mut fast, &source)
            .unwrap();
        cache.purge();
        // still alive: refcount was 1 while `held` is live
        assert_eq!(held.as_slice().len() as u64, WINDOW_SIZE);
        drop(held);
        cache.purge();
    }

    #[test]
    fn drop_index_requires_no_outstanding_borrows() {
        let cache = IndexMapCache::new(4);
        let source = HeapSource(Arc::from(vec![0u8; WINDOW_SIZE as usize]));
        let mut fast = FastSlot::new();
        let idx = new_identity();
        let w = cache.get(idx, BlockOffset(0), 8, &mut fast, &source).unwrap();
        drop(w);
        cache.drop_index(idx); // should not panic: no outstanding borrow
    }
}
