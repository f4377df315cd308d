// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background compaction plus foreground reclaim when free segments run low.
//!
//! Grounded on the teacher's `gc/mod.rs` `GcStrategy` trait
//! (`StaleThresholdStrategy`, `SpaceAmpStrategy`) and
//! `value_log.rs::rollover` (read live entries from candidate segments,
//! re-home them, mark the source stale/free); here entries are rewritten
//! into a reserved-pool slot of the single device rather than a brand new
//! segment file, matching `spec.md` §4.5 `AllocForGC`. The dedicated
//! background thread is a **(supplement)** grounded on
//! `examples/original_source/src/Volumes.cc`'s `GCThdEntry`
//! (`usleep(1_000_000)`), since `spec.md` describes `BackGC`/`ForeGC`/
//! `FullGC` as entry points without spelling out that background GC needs
//! its own thread distinct from the writer and timeout threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::BlockDevice;
use crate::digest::KeyDigest;
use crate::index::{IndexTable, NewEntry};
use crate::request::Request;
use crate::segment::record::{parse_payload, SegHeader};
use crate::segment::{self, OpenSegment, SegmentManager};
use crate::Result;

/// Thresholds and timing for the three GC entry points, resolved from
/// [`crate::Config`] at store open.
#[derive(Clone, Copy, Debug)]
pub struct GcThresholds {
    pub background_trigger: f32,
    pub background_utilization: f32,
    pub foreground_utilization: f32,
    pub full_utilization: f32,
    pub background_interval: Duration,
}

/// A record staged into the GC write buffer, carrying the source location
/// needed for the CAS relocation once the destination segment is written.
struct StagedRecord {
    digest: KeyDigest,
    source_offset: u32,
}

pub struct GcManager {
    device: Arc<dyn BlockDevice>,
    meta_size: u64,
    segment_size: u32,
    segment_manager: Arc<SegmentManager>,
    index: Arc<IndexTable>,
    thresholds: GcThresholds,
    stop: AtomicBool,
    /// Serializes GC passes: only one compaction runs at a time, whether
    /// triggered by the background thread or a foreground allocation
    /// failure.
    pass_lock: Mutex<()>,
}

impl GcManager {
    #[must_use]
    pub fn new(
        device: Arc<dyn BlockDevice>,
        meta_size: u64,
        segment_size: u32,
        segment_manager: Arc<SegmentManager>,
        index: Arc<IndexTable>,
        thresholds: GcThresholds,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            meta_size,
            segment_size,
            segment_manager,
            index,
            thresholds,
            stop: AtomicBool::new(false),
            pass_lock: Mutex::new(()),
        })
    }

    fn read_segment(&self, id: u32) -> Result<Vec<u8>> {
        let offset = segment::segment_offset(self.meta_size, self.segment_size, id);
        let mut image = vec![0u8; self.segment_size as usize];
        self.device.read_at(&mut image, offset)?;
        Ok(image)
    }

    /// Runs one compaction pass over segments whose utilization is below
    /// `threshold`. Returns the number of segments freed.
    pub fn run_pass(&self, threshold: f32) -> Result<u32> {
        let _guard = self.pass_lock.lock().expect("lock is poisoned");
        let candidates = self.segment_manager.utilization_candidates(threshold);
        let mut freed = 0;

        for candidate in candidates {
            if self.compact_segment(candidate.id)? {
                freed += 1;
            }
        }

        Ok(freed)
    }

    /// Compacts one source segment: relocates every still-live record into
    /// fresh segments drawn from the GC reserve, then frees the source.
    /// Returns `true` if the source was freed.
    fn compact_segment(&self, source_id: u32) -> Result<bool> {
        let image = self.read_segment(source_id)?;
        let seg_header = SegHeader::decode(&image[..SegHeader::ENCODED_LEN])?;
        let records = parse_payload(&seg_header, &image[SegHeader::ENCODED_LEN..])?;

        let mut staging = OpenSegment::new(self.segment_size);
        let mut staged: Vec<StagedRecord> = Vec::new();

        for record in &records {
            if record.header.value_len == 0 {
                // GC must never move a tombstone (`spec.md` §4.5); it is
                // reclaimed only when the segment holding it is itself
                // compacted away.
                continue;
            }

            let Some(current) = self.index.get(record.header.digest) else {
                continue;
            };
            let is_live = current.segment_id == source_id && current.offset == record.header.offset;
            if !is_live {
                continue;
            }

            let mut accepted = staging.put(
                Arc::new(Request::new()),
                record.header.digest,
                record.key.clone(),
                record.value.clone(),
                record.header.timestamp,
            );

            if !accepted {
                self.flush_staging(&mut staging, &mut staged, source_id)?;
                accepted = staging.put(
                    Arc::new(Request::new()),
                    record.header.digest,
                    record.key.clone(),
                    record.value.clone(),
                    record.header.timestamp,
                );
                debug_assert!(accepted, "a freshly rotated buffer must accept any in-bounds record");
            }

            staged.push(StagedRecord {
                digest: record.header.digest,
                source_offset: record.header.offset,
            });
        }

        if !staging.is_empty() {
            self.flush_staging(&mut staging, &mut staged, source_id)?;
        }

        self.segment_manager.free(source_id);
        log::info!("gc compacted and freed segment {source_id}");
        Ok(true)
    }

    /// Allocates a destination segment, writes the staged records, and
    /// CAS-relocates each moved entry's index slot. `staged` must be in the
    /// same order the records were `put` into `staging`, since
    /// `write_to_device` resolves them in that same order.
    fn flush_staging(
        &self,
        staging: &mut OpenSegment,
        staged: &mut Vec<StagedRecord>,
        source_id: u32,
    ) -> Result<()> {
        if staging.is_empty() {
            return Ok(());
        }

        let now = now_micros();
        let dest_id = self.segment_manager.alloc_for_gc(now)?;
        let offset = segment::segment_offset(self.meta_size, self.segment_size, dest_id);

        let (committed, free_bytes) =
            staging.write_to_device(self.device.as_ref(), dest_id, offset, self.segment_size)?;
        self.segment_manager.mark_used(dest_id, free_bytes);

        for (record, source) in committed.iter().zip(staged.iter()) {
            debug_assert_eq!(record.digest, source.digest);
            let moved = self.index.cas_relocate(
                record.digest,
                (source_id, source.source_offset),
                NewEntry {
                    digest: record.digest,
                    segment_id: record.segment_id,
                    offset: record.offset,
                    value_len: record.value_len,
                    timestamp: record.timestamp,
                },
            )?;
            if !moved {
                log::trace!(
                    "gc relocation of {:?} superseded by a concurrent writer, skipping",
                    record.digest
                );
            }
        }

        *staging = OpenSegment::new(self.segment_size);
        staged.clear();
        Ok(())
    }

    /// **BackGC** - one pass if the free-segment ratio is below
    /// `background_trigger` and utilization candidates exist below
    /// `background_utilization`.
    pub fn back_gc(&self) -> Result<u32> {
        let free_ratio = f64::from(self.segment_manager.count_free())
            / f64::from(self.segment_manager.segment_count().max(1));
        if free_ratio >= f64::from(self.thresholds.background_trigger) {
            return Ok(0);
        }
        self.run_pass(self.thresholds.background_utilization)
    }

    /// **ForeGC** - invoked synchronously by a writer that failed to
    /// allocate; returns `true` iff it freed at least one segment.
    pub fn fore_gc(&self) -> Result<bool> {
        let freed = self.run_pass(self.thresholds.foreground_utilization)?;
        Ok(freed > 0)
    }

    /// **FullGC** - scans all `Used` segments and compacts anything below
    /// `full_utilization`; intended as an operator action.
    pub fn full_gc(&self) -> Result<u32> {
        self.run_pass(self.thresholds.full_utilization)
    }

    fn background_loop(self: &Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(self.thresholds.background_interval);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.back_gc() {
                log::warn!("background gc pass failed: {err}");
            }
        }
    }

    /// Spawns the dedicated background GC thread.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let gc = Arc::clone(self);
        std::thread::spawn(move || gc.background_loop())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use crate::digest::KeyDigest;
    use crate::index::{IndexTable, NewEntry};
    use crate::slice::Slice;
    use test_log::test;

    struct Harness {
        gc: Arc<GcManager>,
        index: Arc<IndexTable>,
        segment_manager: Arc<SegmentManager>,
        device: Arc<dyn BlockDevice>,
        meta_size: u64,
        segment_size: u32,
        _dir: tempfile::TempDir,
    }

    fn build_harness(segment_count: u32, segment_size: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let meta_size = 4_096u64;
        let device: Arc<dyn BlockDevice> = Arc::new(
            FileDevice::create(&path, meta_size + u64::from(segment_count) * u64::from(segment_size))
                .unwrap(),
        );
        let segment_manager = Arc::new(SegmentManager::new(segment_count, segment_size, 1));
        let index = Arc::new(IndexTable::new(97, 16));

        let thresholds = GcThresholds {
            background_trigger: 0.5,
            background_utilization: 0.5,
            foreground_utilization: 0.7,
            full_utilization: 0.9,
            background_interval: Duration::from_secs(3_600),
        };

        let gc = GcManager::new(
            Arc::clone(&device),
            meta_size,
            segment_size,
            Arc::clone(&segment_manager),
            Arc::clone(&index),
            thresholds,
        );

        Harness {
            gc,
            index,
            segment_manager,
            device,
            meta_size,
            segment_size,
            _dir: dir,
        }
    }

    /// Writes a segment directly (bypassing the write pipeline) so GC tests
    /// can set up specific source-segment contents.
    fn write_segment(h: &Harness, id: u32, entries: &[(&[u8], &[u8], u64)]) {
        let mut staging = OpenSegment::new(h.segment_size);
        for (key, value, ts) in entries {
            let digest = KeyDigest::compute(key);
            staging.put(
                Arc::new(Request::new()),
                digest,
                Slice::new(key),
                Slice::new(value),
                *ts,
            );
        }
        let offset = segment::segment_offset(h.meta_size, h.segment_size, id);
        let (committed, free_bytes) = staging
            .write_to_device(h.device.as_ref(), id, offset, h.segment_size)
            .unwrap();
        h.segment_manager.mark_used(id, free_bytes);

        for record in &committed {
            h.index
                .update(NewEntry {
                    digest: record.digest,
                    segment_id: record.segment_id,
                    offset: record.offset,
                    value_len: record.value_len,
                    timestamp: record.timestamp,
                })
                .unwrap();
        }
    }

    #[test]
    fn compaction_relocates_live_entries_and_frees_source() {
        let h = build_harness(4, 4_096);

        let source = h.segment_manager.alloc(1).unwrap();
        write_segment(&h, source, &[(b"a", b"1", 1), (b"b", b"2", 2)]);

        // Overwrite "a" elsewhere so only "b" is still live in `source`.
        let dest = h.segment_manager.alloc(2).unwrap();
        write_segment(&h, dest, &[(b"a", b"new", 5)]);

        let freed = h.gc.run_pass(1.1).unwrap(); // threshold > 1 forces every Used segment to qualify
        assert!(freed >= 1);

        assert_eq!(h.segment_manager.state_of(source), crate::segment::SegmentState::Free);

        let a = h.index.get(KeyDigest::compute(b"a")).unwrap();
        assert_eq!(a.value_len, 3);
        let b = h.index.get(KeyDigest::compute(b"b")).unwrap();
        assert_eq!(b.value_len, 1);
    }

    #[test]
    fn tombstones_are_never_relocated() {
        let h = build_harness(4, 4_096);

        let source = h.segment_manager.alloc(1).unwrap();
        write_segment(&h, source, &[(b"a", b"1", 1)]);
        // Delete "a" via the index directly (as the write path would).
        h.index
            .update(NewEntry {
                digest: KeyDigest::compute(b"a"),
                segment_id: source,
                offset: 0,
                value_len: 0,
                timestamp: 2,
            })
            .unwrap();

        h.gc.run_pass(1.1).unwrap();
        assert!(h.index.get(KeyDigest::compute(b"a")).is_none());
    }
}
