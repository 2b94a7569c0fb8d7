// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error.
    Io(std::io::Error),

    /// The data did not match the expected magic value.
    InvalidMagic { expected: u32, found: u32 },

    /// The data's stored length exceeded the format's maximum.
    InvalidLength(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "DecodeError(io: {e})"),
            Self::InvalidMagic { expected, found } => {
                write!(f, "DecodeError(invalid magic: expected {expected:#x}, found {found:#x})")
            }
            Self::InvalidLength(n) => write!(f, "DecodeError(invalid length: {n})"),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidMagic { .. } | Self::InvalidLength(_) => None,
        }
    }
}

/// Trait to serialize a fixed on-disk layout.
pub trait Encode {
    /// Serializes into a writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into a freshly allocated vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("in-memory encode cannot fail");
        v
    }
}

/// Trait to deserialize a fixed on-disk layout.
pub trait Decode {
    /// Deserializes from a reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    struct Pair(u32, u16);

    impl Encode for Pair {
        fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
            writer.write_u32::<LittleEndian>(self.0)?;
            writer.write_u16::<LittleEndian>(self.1)?;
            Ok(())
        }
    }

    impl Decode for Pair {
        fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
            let a = reader.read_u32::<LittleEndian>()?;
            let b = reader.read_u16::<LittleEndian>()?;
            Ok(Self(a, b))
        }
    }

    #[test]
    #[allow(clippy::indexing_slicing)]
    fn round_trip() {
        let p = Pair(42, 7);
        let bytes = p.encode_into_vec();
        let p2 = Pair::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!((p.0, p.1), (p2.0, p2.1));
    }
}
