// Element: the atomic unit held in a tree node. See `BTreeElm` in the
// reference implementation's `btree.h`.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::constants::{ELEMENT_FLAG_DELETED, PREFIX_LEN};
use crate::offset::BlockOffset;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// One element of a tree node: either a leaf pointer to a data record, or
/// (in an internal node) a pointer to a child node, paired with a cached
/// key prefix used to order it without dereferencing the child/record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Element {
    /// Offset of the data record (leaf) or child node (internal).
    pub ro: BlockOffset,

    /// Number of meaningful bytes in `data` (`0..=PREFIX_LEN`).
    pub stored_len: i16,

    /// Flag bits; only [`ELEMENT_FLAG_DELETED`] is defined for leaf elements.
    pub flags: u16,

    /// Cached key prefix, `stored_len` bytes significant, zero-padded.
    pub data: [u8; PREFIX_LEN],
}

impl Element {
    /// Builds a new, non-deleted element.
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    pub fn new(ro: BlockOffset, key: &[u8]) -> Self {
        let mut data = [0u8; PREFIX_LEN];
        let len = key.len().min(PREFIX_LEN);
        data[..len].copy_from_slice(&key[..len]);
        Self {
            ro,
            stored_len: len as i16,
            flags: 0,
            data,
        }
    }

    /// Marks this element as a tombstone companion.
    #[must_use]
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        if deleted {
            self.flags |= ELEMENT_FLAG_DELETED;
        } else {
            self.flags &= !ELEMENT_FLAG_DELETED;
        }
        self
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & ELEMENT_FLAG_DELETED != 0
    }

    /// The significant prefix bytes (`data[..stored_len]`).
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    pub fn key(&self) -> &[u8] {
        #[allow(clippy::cast_sign_loss)]
        let len = (self.stored_len.max(0) as usize).min(PREFIX_LEN);
        &self.data[..len]
    }

    /// A zeroed, empty element used to fill unused node slots.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ro: BlockOffset(0),
            stored_len: 0,
            flags: 0,
            data: [0u8; PREFIX_LEN],
        }
    }
}

impl Default for Element {
    fn default() -> Self {
        Self::empty()
    }
}

impl Encode for Element {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.ro.0)?;
        writer.write_i16::<LittleEndian>(self.stored_len)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl Decode for Element {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let ro = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let stored_len = reader.read_i16::<LittleEndian>()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let mut data = [0u8; PREFIX_LEN];
        reader.read_exact(&mut data)?;
        Ok(Self {
            ro,
            stored_len,
            flags,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn round_trip() {
        let e = Element::new(BlockOffset(1234), b"hello world").with_deleted(true);
        let bytes = e.encode_into_vec();
        let e2 = Element::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(e, e2);
        assert_eq!(e2.key(), b"hello wo");
        assert!(e2.is_deleted());
    }

    #[test]
    fn short_key_not_padded_into_comparisons() {
        let e = Element::new(BlockOffset(1), b"ab");
        assert_eq!(e.key(), b"ab");
        assert_eq!(e.stored_len, 2);
    }
}
