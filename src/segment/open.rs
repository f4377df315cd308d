// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory write aggregator for the *next* segment to be written.
//!
//! Grounded on `spec.md` §4.3, generalized from the teacher's
//! `segment/writer.rs` (header + length-prefixed records, per-record
//! checksum) and `segment/multi_writer.rs` (rotate on a size threshold)
//! from "one growing file, rotate to a new file" to "one fixed-capacity
//! in-memory buffer, handed off to a background writer."

use std::sync::Arc;
use std::time::Instant;

use crate::device::BlockDevice;
use crate::digest::KeyDigest;
use crate::request::{FailureReason, Placement, Request};
use crate::segment::record::{RecordHeader, SegHeader};
use crate::slice::Slice;
use crate::Result;

struct PendingRecord {
    request: Arc<Request>,
    digest: KeyDigest,
    key: Slice,
    value: Slice,
    timestamp: u64,
}

/// Entry handed to the caller once its record's segment was durably written,
/// ready for [`crate::index::IndexTable::update`].
pub struct CommittedRecord {
    pub request: Arc<Request>,
    pub digest: KeyDigest,
    pub segment_id: u32,
    pub offset: u32,
    pub value_len: u32,
    pub timestamp: u64,
}

/// Accumulates pending records targeted at one not-yet-allocated segment.
pub struct OpenSegment {
    records: Vec<PendingRecord>,
    bytes_used: u32,
    capacity: u32,
    created_at: Instant,
    completed: bool,
}

impl OpenSegment {
    #[must_use]
    pub fn new(segment_size: u32) -> Self {
        Self {
            records: Vec::new(),
            bytes_used: 0,
            capacity: segment_size.saturating_sub(SegHeader::ENCODED_LEN as u32),
            created_at: Instant::now(),
            completed: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Accepts a record iff it fits and the buffer is not yet closed.
    /// Ordering inside a segment is the order of successful `put` calls.
    pub fn put(
        &mut self,
        request: Arc<Request>,
        digest: KeyDigest,
        key: Slice,
        value: Slice,
        timestamp: u64,
    ) -> bool {
        if self.completed {
            return false;
        }

        let record_size = RecordHeader::ENCODED_LEN + key.len() + value.len();
        if self.bytes_used as usize + record_size > self.capacity as usize {
            return false;
        }

        self.bytes_used += record_size as u32;
        self.records.push(PendingRecord {
            request,
            digest,
            key,
            value,
            timestamp,
        });
        true
    }

    /// Marks the buffer closed; subsequent `put` calls return `false`.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    /// `true` once `now` is at least `expire` past creation and the buffer
    /// holds at least one record - the timeout thread's rotation trigger.
    #[must_use]
    pub fn complete_if_expired(&mut self, expire: std::time::Duration) -> bool {
        if !self.records.is_empty() && self.created_at.elapsed() >= expire {
            self.completed = true;
            true
        } else {
            false
        }
    }

    /// Serializes header and records into one contiguous image, pads to
    /// `segment_size`, and writes it at the segment's physical offset.
    /// On success, returns each record's durable placement so the caller
    /// can resolve its `Request` and update the index.
    pub fn write_to_device(
        &self,
        device: &dyn BlockDevice,
        segment_id: u32,
        segment_offset: u64,
        segment_size: u32,
    ) -> Result<(Vec<CommittedRecord>, u32)> {
        let mut payload = Vec::with_capacity(self.bytes_used as usize);
        let mut committed = Vec::with_capacity(self.records.len());

        for record in &self.records {
            // In-segment offset of this header, i.e. relative to the start
            // of the segment image (past `SegHeader`) rather than the start
            // of the payload - this is what the live index stores, and what
            // GC's liveness check and segment-scan recovery compare against,
            // so it must match `CommittedRecord::offset` exactly.
            let in_segment_offset = SegHeader::ENCODED_LEN as u32 + payload.len() as u32;
            let header = RecordHeader {
                digest: record.digest,
                key_len: record.key.len() as u32,
                value_len: record.value.len() as u32,
                offset: in_segment_offset,
                timestamp: record.timestamp,
            };
            header.encode(&mut payload);
            payload.extend_from_slice(&record.key);
            payload.extend_from_slice(&record.value);

            committed.push(CommittedRecord {
                request: Arc::clone(&record.request),
                digest: record.digest,
                segment_id,
                offset: in_segment_offset,
                value_len: header.value_len,
                timestamp: record.timestamp,
            });
        }

        let seg_header = SegHeader {
            record_count: self.records.len() as u32,
            payload_len: payload.len() as u32,
            payload_crc32: crc32fast::hash(&payload),
        };

        let mut image = Vec::with_capacity(segment_size as usize);
        image.extend_from_slice(&seg_header.encode());
        image.extend_from_slice(&payload);

        let free_bytes = segment_size as usize - image.len();
        image.resize(segment_size as usize, 0);

        device.write_at(&image, segment_offset)?;

        Ok((committed, free_bytes as u32))
    }

    /// Releases all waiters with a terminal failure, e.g. because
    /// allocation or the device write failed.
    pub fn notify_failed(&self, reason: FailureReason) {
        for record in &self.records {
            record.request.resolve_failure(reason);
        }
    }
}

impl CommittedRecord {
    pub fn resolve(&self) {
        self.request.resolve_success(Placement {
            segment_id: self.segment_id,
            offset: self.offset,
        });
    }
}
