// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::constants::{INDEX_MASK, WINDOW_MASK};

/// A byte offset into an index file.
///
/// Kept as a typed newtype rather than a bare `u64` so that node/parent/leaf
/// offsets can't be accidentally mixed with unrelated integers; see the
/// "raw cross-module pointers" design note for why this crate never builds
/// an in-memory pointer graph of nodes.
#[derive(Copy, Clone, Default, Debug, Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct BlockOffset(pub u64);

impl std::ops::Deref for BlockOffset {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::AddAssign<Self> for BlockOffset {
    fn add_assign(&mut self, rhs: Self) {
        *self += *rhs;
    }
}

impl std::ops::AddAssign<u64> for BlockOffset {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl std::fmt::Display for BlockOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockOffset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl BlockOffset {
    /// Rounds this offset down to the start of its cache window.
    #[must_use]
    pub fn window_start(self) -> Self {
        Self(self.0 & !WINDOW_MASK)
    }
}

/// An opaque cursor position: `(leaf node offset, element slot)` packed into
/// one `u64`. Callers must never depend on the bit layout; see design note
/// on keeping `IRo` opaque.
#[derive(Copy, Clone, Default, Debug, Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct IndexRef(u64);

impl IndexRef {
    /// Builds a cursor position from a leaf node offset and a slot within it.
    ///
    /// # Panics
    /// Panics if `slot` does not fit in the low bits reserved for it
    /// (i.e. `slot >= NODE_CAP`).
    #[must_use]
    pub fn new(node_offset: BlockOffset, slot: usize) -> Self {
        debug_assert!((slot as u64) <= INDEX_MASK, "slot out of range");
        Self(node_offset.0 | (slot as u64))
    }

    /// Decomposes this reference into its node offset and element slot.
    #[must_use]
    pub fn decompose(self) -> (BlockOffset, usize) {
        (
            BlockOffset(self.0 & !INDEX_MASK),
            (self.0 & INDEX_MASK) as usize,
        )
    }

    #[must_use]
    pub fn node_offset(self) -> BlockOffset {
        self.decompose().0
    }

    #[must_use]
    pub fn slot(self) -> usize {
        self.decompose().1
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for IndexRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (node, slot) = self.decompose();
        write!(f, "IndexRef(node={node}, slot={slot})")
    }
}
