// Header: the first block of an index file. See `BTreeHead`/`IndexHead` in
// `btree.h` and §3/§6 of SPEC_FULL.md.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::constants::{FLAG_SYNCED, FLAG_TEMP, FORMAT_VERSION, MAGIC};
use crate::offset::{BlockOffset, IndexRef};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The first block of an index file.
#[derive(Copy, Clone, Debug)]
pub struct Header {
    pub magic: u32,
    pub version: u16,
    pub head_size: u16,
    pub flags: u16,
    pub generation: u64,
    pub root: BlockOffset,
    pub tab_append: BlockOffset,
    pub append: BlockOffset,
    pub ext_append: BlockOffset,
    pub first_elm: IndexRef,
    pub last_elm: IndexRef,
}

/// Fixed on-disk size of an encoded [`Header`] (`4+2+2+2+2+8*7` bytes).
pub const ENCODED_SIZE: u16 = 68;

impl Header {
    /// Builds a fresh header for a brand-new index file, rooted at a single
    /// empty leaf at `root`.
    #[must_use]
    pub fn new(generation: u64, root: BlockOffset, head_size: u16, temp: bool) -> Self {
        Self {
            magic: MAGIC,
            // Written as 0 ("in progress") until the creating writer commits;
            // see `lifecycle::create` for the two-phase write.
            version: 0,
            head_size,
            flags: if temp { FLAG_TEMP } else { 0 },
            generation,
            root,
            tab_append: BlockOffset(0),
            append: root,
            ext_append: BlockOffset(0),
            first_elm: IndexRef::new(root, 0),
            last_elm: IndexRef::new(root, 0),
        }
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.flags & FLAG_SYNCED != 0
    }

    #[must_use]
    pub fn is_temp(&self) -> bool {
        self.flags & FLAG_TEMP != 0
    }

    pub fn set_synced(&mut self, synced: bool) {
        if synced {
            self.flags |= FLAG_SYNCED;
        } else {
            self.flags &= !FLAG_SYNCED;
        }
    }

    /// Validates magic/version; does not check generation (the caller
    /// compares against the data table's live generation).
    pub fn validate_format(&self) -> Result<(), DecodeError> {
        if self.magic != MAGIC {
            return Err(DecodeError::InvalidMagic {
                expected: MAGIC,
                found: self.magic,
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(DecodeError::InvalidLength(self.version as usize));
        }
        Ok(())
    }
}

impl Encode for Header {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.head_size)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        // pad to 8-byte alignment before the u64 fields
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u64::<LittleEndian>(self.generation)?;
        writer.write_u64::<LittleEndian>(self.root.0)?;
        writer.write_u64::<LittleEndian>(self.tab_append.0)?;
        writer.write_u64::<LittleEndian>(self.append.0)?;
        writer.write_u64::<LittleEndian>(self.ext_append.0)?;
        writer.write_u64::<LittleEndian>(self.first_elm.raw())?;
        writer.write_u64::<LittleEndian>(self.last_elm.raw())?;
        Ok(())
    }
}

impl Decode for Header {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u16::<LittleEndian>()?;
        let head_size = reader.read_u16::<LittleEndian>()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let _pad = reader.read_u16::<LittleEndian>()?;
        let generation = reader.read_u64::<LittleEndian>()?;
        let root = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let tab_append = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let append = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let ext_append = BlockOffset(reader.read_u64::<LittleEndian>()?);
        let first_elm = reader.read_u64::<LittleEndian>()?;
        let last_elm = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            magic,
            version,
            head_size,
            flags,
            generation,
            root,
            tab_append,
            append,
            ext_append,
            first_elm: IndexRef::new(BlockOffset(first_elm & !crate::constants::INDEX_MASK), (first_elm & crate::constants::INDEX_MASK) as usize),
            last_elm: IndexRef::new(BlockOffset(last_elm & !crate::constants::INDEX_MASK), (last_elm & crate::constants::INDEX_MASK) as usize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn round_trip() {
        let mut h = Header::new(7, BlockOffset(4096), 128, false);
        h.set_synced(true);
        let bytes = h.encode_into_vec();
        let h2 = Header::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(h.generation, h2.generation);
        assert_eq!(h.root, h2.root);
        assert!(h2.is_synced());
        assert!(!h2.is_temp());
        h2.validate_format().unwrap();
    }
}
