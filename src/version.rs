// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Disk format version, embedded in the superblock alongside the magic number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Version {
    /// Version for 1.x.x releases
    V1,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<Version> for u8 {
    fn from(value: Version) -> Self {
        match value {
            Version::V1 => 1,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            _ => Err(()),
        }
    }
}

/// b"SEGKVDB1" read as a little-endian u64 - identifies the device as a segkv store.
pub const MAGIC_NUMBER: u64 = 0x3144_4256_4B47_4553;

impl Version {
    pub(crate) fn read_header<R: std::io::Read>(reader: &mut R) -> crate::Result<Self> {
        let magic = reader.read_u64::<LittleEndian>()?;
        if magic != MAGIC_NUMBER {
            return Err(crate::Error::Corrupt("superblock magic mismatch"));
        }

        let version = reader.read_u8()?;
        Self::try_from(version).map_err(|()| crate::Error::InvalidVersion(None))
    }

    pub(crate) fn write_header<W: std::io::Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(MAGIC_NUMBER)?;
        writer.write_u8(u8::from(self))?;
        Ok(())
    }
}
