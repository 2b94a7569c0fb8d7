// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the B+tree index engine.
#[derive(Debug)]
pub enum Error {
    /// I/O error not otherwise classified below.
    Io(std::io::Error),

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),

    /// Opening or creating the index file failed.
    OpenFailed(std::io::Error),

    /// The header's generation did not match the data table's.
    GenerationMismatch {
        /// Generation recorded in the index header.
        expected: u64,
        /// Generation reported by the data table.
        found: u64,
    },

    /// The header's magic/version were wrong, or `SYNCED` was clear on open.
    CorruptHeader {
        /// Human-readable reason, for logging.
        reason: &'static str,
    },

    /// A short write occurred while extending the index file.
    ExtendFailed(std::io::Error),

    /// `mmap` of an index-map window failed.
    MapFailed(std::io::Error),

    /// The downstream filter asked the scan to stop early.
    ScanBroken,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::OpenFailed(e) => write!(f, "failed to open index: {e}"),
            Self::GenerationMismatch { expected, found } => write!(
                f,
                "index generation {expected} does not match table generation {found}"
            ),
            Self::CorruptHeader { reason } => write!(f, "corrupt index header: {reason}"),
            Self::ExtendFailed(e) => write!(f, "failed to extend index file: {e}"),
            Self::MapFailed(e) => write!(f, "failed to map index window: {e}"),
            Self::ScanBroken => write!(f, "scan was interrupted by downstream filter"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::OpenFailed(e) | Self::ExtendFailed(e) | Self::MapFailed(e) => {
                Some(e)
            }
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::GenerationMismatch { .. } | Self::CorruptHeader { .. } | Self::ScanBroken => {
                None
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Index engine result.
pub type Result<T> = std::result::Result<T, Error>;
