// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The single on-disk header describing geometry and mutable counters.
//!
//! Grounded on the teacher's `manifest.rs` (a single metadata blob,
//! rewritten atomically) but the payload shape follows `spec.md` §3
//! ("Superblock — { magic, hash-table size, element count, tombstone
//! count, segment size, segment count, current-segment id, sizes of
//! sb/index/data regions, device size }").

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::sync::Mutex;

use crate::device::BlockDevice;
use crate::version::Version;
use crate::{Error, Result};

/// Sentinel stored in `current_segment_id` when no segment is currently open.
pub const NO_SEGMENT: u32 = u32::MAX;

/// Fixed size of the on-disk superblock region, sector-aligned.
pub const SUPERBLOCK_REGION_SIZE: u64 = 4 * 1_024;

/// Encoded size of the superblock payload, before trailing padding.
const ENCODED_LEN: usize = 8 // magic
    + 1 // version
    + 4 // hash_table_size
    + 8 // element_count
    + 8 // tombstone_count
    + 4 // segment_size
    + 4 // segment_count
    + 4 // current_segment_id
    + 8 // sb_size
    + 8 // index_size
    + 8 // data_size
    + 8 // device_size
    + 4; // crc32

/// Mutable counters and fixed geometry describing the store.
///
/// `spec.md` §5 calls for a single mutex guarding the superblock's
/// counters, since updates are infrequent relative to the write path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    /// Number of buckets in the hash index, fixed at create time.
    pub hash_table_size: u32,
    /// Number of live (non-tombstone) entries currently indexed.
    pub element_count: u64,
    /// Number of tombstone entries currently indexed.
    pub tombstone_count: u64,
    /// Size in bytes of one segment, fixed at create time.
    pub segment_size: u32,
    /// Total number of segments the data region is divided into.
    pub segment_count: u32,
    /// Id of the segment most recently handed out by the writer thread.
    pub current_segment_id: u32,
    /// Size in bytes of the fixed superblock region.
    pub sb_size: u64,
    /// Size in bytes of the hash index region.
    pub index_size: u64,
    /// Size in bytes of the segment data region.
    pub data_size: u64,
    /// Total size in bytes of the backing device.
    pub device_size: u64,
}

impl SuperBlock {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_LEN);
        Version::V1
            .write_header(&mut buf)
            .expect("writing to a Vec never fails");
        buf.write_u32::<LittleEndian>(self.hash_table_size).unwrap();
        buf.write_u64::<LittleEndian>(self.element_count).unwrap();
        buf.write_u64::<LittleEndian>(self.tombstone_count).unwrap();
        buf.write_u32::<LittleEndian>(self.segment_size).unwrap();
        buf.write_u32::<LittleEndian>(self.segment_count).unwrap();
        buf.write_u32::<LittleEndian>(self.current_segment_id)
            .unwrap();
        buf.write_u64::<LittleEndian>(self.sb_size).unwrap();
        buf.write_u64::<LittleEndian>(self.index_size).unwrap();
        buf.write_u64::<LittleEndian>(self.data_size).unwrap();
        buf.write_u64::<LittleEndian>(self.device_size).unwrap();

        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc).unwrap();

        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = buf;
        Version::read_header(&mut reader)?;

        let payload_len = buf.len() - reader.len();
        let body_end = buf.len() - 4;
        let crc_expected = (&buf[body_end..]).read_u32::<LittleEndian>()?;
        let crc_actual = crc32fast::hash(&buf[..body_end]);
        if crc_expected != crc_actual {
            return Err(Error::Corrupt("superblock checksum mismatch"));
        }
        let _ = payload_len;

        let hash_table_size = reader.read_u32::<LittleEndian>()?;
        let element_count = reader.read_u64::<LittleEndian>()?;
        let tombstone_count = reader.read_u64::<LittleEndian>()?;
        let segment_size = reader.read_u32::<LittleEndian>()?;
        let segment_count = reader.read_u32::<LittleEndian>()?;
        let current_segment_id = reader.read_u32::<LittleEndian>()?;
        let sb_size = reader.read_u64::<LittleEndian>()?;
        let index_size = reader.read_u64::<LittleEndian>()?;
        let data_size = reader.read_u64::<LittleEndian>()?;
        let device_size = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            hash_table_size,
            element_count,
            tombstone_count,
            segment_size,
            segment_count,
            current_segment_id,
            sb_size,
            index_size,
            data_size,
            device_size,
        })
    }
}

/// Owns the single superblock and serializes reads/writes of it against the
/// device, under one mutex, per `spec.md` §5 ("The superblock's counters are
/// protected by a single mutex; writes there are infrequent.").
#[derive(Debug)]
pub struct SuperBlockManager {
    inner: Mutex<SuperBlock>,
}

impl SuperBlockManager {
    pub(crate) fn new(sb: SuperBlock) -> Self {
        Self {
            inner: Mutex::new(sb),
        }
    }

    pub(crate) fn load(device: &dyn BlockDevice) -> Result<Self> {
        let mut buf = vec![0u8; ENCODED_LEN];
        device.read_at(&mut buf, 0)?;
        let sb = SuperBlock::decode(&buf)?;
        Ok(Self::new(sb))
    }

    pub(crate) fn persist(&self, device: &dyn BlockDevice) -> Result<()> {
        let buf = self.inner.lock().expect("lock is poisoned").encode();
        device.write_at(&buf, 0)?;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> SuperBlock {
        *self.inner.lock().expect("lock is poisoned")
    }

    pub(crate) fn set_current_segment_id(&self, id: u32) {
        self.inner.lock().expect("lock is poisoned").current_segment_id = id;
    }

    /// Applies an index `Update` outcome to the live counters. `Revive`
    /// (a delete followed by a later live write of the same key) must move
    /// a count from tombstones back to elements, or `element_count` drifts
    /// away from the number of live keys; `Noop` covers both "delete of a
    /// nonexistent key" and "redundant delete of an already-tombstoned
    /// key", neither of which changes either counter.
    pub(crate) fn apply_op(&self, op: crate::index::UpdateOp) {
        let mut sb = self.inner.lock().expect("lock is poisoned");
        match op {
            crate::index::UpdateOp::Insert => sb.element_count += 1,
            crate::index::UpdateOp::Delete => {
                sb.tombstone_count += 1;
                sb.element_count = sb.element_count.saturating_sub(1);
            }
            crate::index::UpdateOp::Revive => {
                sb.element_count += 1;
                sb.tombstone_count = sb.tombstone_count.saturating_sub(1);
            }
            crate::index::UpdateOp::Update
            | crate::index::UpdateOp::Noop
            | crate::index::UpdateOp::Stale => {}
        }
    }
}
