// Node codec: fixed-size tree nodes with parent back-pointers. See
// `BTreeNode` in `btree.h` and §4.2 of SPEC_FULL.md.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::constants::{INDEX_MASK, NODE_CAP, NODE_FLAG_LEAF};
use crate::element::Element;
use crate::offset::BlockOffset;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A fixed-size B+tree node: a parent back-reference, an element count, a
/// leaf flag, and up to [`NODE_CAP`] elements.
#[derive(Clone, Debug)]
pub struct Node {
    /// `parent_offset | slot`, or 0 at the root. See [`Node::parent`].
    pub parent: BlockOffset,

    /// Number of populated elements, `0..=NODE_CAP`.
    pub count: i16,

    /// Flag bits; only [`NODE_FLAG_LEAF`] is defined.
    pub flags: u16,

    /// Element storage; only the first `count` slots are meaningful.
    pub elms: Vec<Element>,
}

impl Node {
    /// Builds an empty node.
    #[must_use]
    pub fn new(is_leaf: bool) -> Self {
        Self {
            parent: BlockOffset(0),
            count: 0,
            flags: if is_leaf { NODE_FLAG_LEAF } else { 0 },
            elms: vec![Element::empty(); NODE_CAP],
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & NODE_FLAG_LEAF != 0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.0 == 0
    }

    /// Decomposes `parent` into `(parent_node_offset, this_node's_slot_in_it)`.
    ///
    /// Mirrors the reference implementation's `(c.parent & ~INDEX_MASK,
    /// c.parent & INDEX_MASK)` extraction.
    #[must_use]
    pub fn parent_slot(&self) -> (BlockOffset, usize) {
        (
            BlockOffset(self.parent.0 & !INDEX_MASK),
            (self.parent.0 & INDEX_MASK) as usize,
        )
    }

    /// Sets `parent` from a parent-node offset and this node's slot in it.
    pub fn set_parent_slot(&mut self, parent_offset: BlockOffset, slot: usize) {
        debug_assert!((slot as u64) <= INDEX_MASK);
        self.parent = BlockOffset(parent_offset.0 | (slot as u64));
    }

    /// The populated elements as a slice.
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    pub fn elements(&self) -> &[Element] {
        #[allow(clippy::cast_sign_loss)]
        let n = self.count.max(0) as usize;
        &self.elms[..n.min(self.elms.len())]
    }

    /// The populated elements as a mutable slice.
    #[allow(clippy::indexing_slicing)]
    pub fn elements_mut(&mut self) -> &mut [Element] {
        #[allow(clippy::cast_sign_loss)]
        let n = self.count.max(0) as usize;
        let n = n.min(self.elms.len());
        &mut self.elms[..n]
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count as usize >= NODE_CAP
    }
}

impl Encode for Node {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.parent.0)?;
        writer.write_i16::<LittleEndian>(self.count)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        for i in 0..NODE_CAP {
            let empty = Element::empty();
            let e = self.elms.get(i).unwrap_or(&empty);
            e.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for Node {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let parent = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let count = reader.read_i16::<LittleEndian>()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let mut elms = Vec::with_capacity(NODE_CAP);
        for _ in 0..NODE_CAP {
            elms.push(Element::decode_from(reader)?);
        }
        Ok(Self {
            parent,
            count,
            flags,
            elms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn round_trip_empty() {
        let n = Node::new(true);
        let bytes = n.encode_into_vec();
        let n2 = Node::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(n.count, n2.count);
        assert_eq!(n.flags, n2.flags);
        assert_eq!(n.elms.len(), n2.elms.len());
    }

    #[test]
    fn parent_slot_round_trip() {
        let mut n = Node::new(false);
        n.set_parent_slot(BlockOffset(4096), 5);
        let (p, s) = n.parent_slot();
        assert_eq!(p, BlockOffset(4096));
        assert_eq!(s, 5);
    }
}
