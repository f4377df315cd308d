// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::version::Version;

/// Represents errors that can occur in the store
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Superblock magic or index checksum did not verify
    Corrupt(&'static str),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// No free segment slot was available, and GC could not free one
    NoSpace,

    /// The hash index's probe limit was exhausted while inserting
    TableFull,

    /// Key is missing, oversized, or the store is closed
    InvalidArgument(&'static str),

    /// Read path: key was not found
    NotFound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Store result
pub type Result<T> = std::result::Result<T, Error>;
