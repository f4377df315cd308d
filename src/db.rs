// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The top-level store handle: formats or recovers a device, and wires the
//! segment manager, hash index, write pipeline and GC manager together
//! behind `put`/`get`/`delete`/`close`/`do_gc`.
//!
//! Grounded on the teacher's `value_log.rs` (`ValueLog<C>(Arc<ValueLogInner<C>>)`,
//! `create_new` vs `recover` dispatch, `Mutex`-guarded rollover) generalized
//! from a directory-of-segment-files layout to the single fixed-layout
//! device `spec.md` §3 describes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cache::ValueCache;
use crate::config::Config;
use crate::device::{BlockDevice, FileDevice};
use crate::digest::KeyDigest;
use crate::gc::{GcManager, GcThresholds};
use crate::index::{IndexTable, NewEntry, UpdateOp};
use crate::pipeline::{PipelineThreads, WritePipeline};
use crate::segment::manager::STATE_RECORD_LEN;
use crate::segment::record::{parse_payload, RecordHeader, SegHeader};
use crate::segment::{self, SegmentManager, SegmentState};
use crate::slice::Slice;
use crate::superblock::{SuperBlock, SuperBlockManager, NO_SEGMENT, SUPERBLOCK_REGION_SIZE};
use crate::{Error, Result};

/// Maximum accepted user key length (`spec.md` §3: "length ≤ 64 KiB").
pub const MAX_KEY_LEN: usize = 64 * 1_024;

/// Segments kept unavailable to normal writers so GC can always make
/// forward progress (`spec.md` §4.1 `AllocForGC`).
const GC_RESERVE_SEGMENTS: u32 = 1;

fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn next_prime(mut n: u32) -> u32 {
    fn is_prime(n: u32) -> bool {
        if n < 2 {
            return false;
        }
        let mut i = 2;
        while i * i <= n {
            if n % i == 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    if n < 2 {
        n = 2;
    }
    while !is_prime(n) {
        n += 1;
    }
    n
}

/// Fixed device geometry derived at create/open time from hash-table size,
/// segment size, and device capacity (`spec.md` §3 "Device layout").
struct Layout {
    table_size: u32,
    segment_count: u32,
    index_offset: u64,
    segstate_offset: u64,
    meta_size: u64,
}

fn layout_for(device_size: u64, hash_table_size: u32, segment_size: u32) -> Result<Layout> {
    let table_size = next_prime(hash_table_size.max(7));
    let index_size = u64::from(table_size) * crate::index::ENTRY_LEN as u64 + 4;

    let remaining = device_size
        .checked_sub(SUPERBLOCK_REGION_SIZE + index_size)
        .ok_or(Error::InvalidArgument("device too small for superblock and hash index"))?;

    let per_segment_cost = STATE_RECORD_LEN as u64 + u64::from(segment_size);
    let segment_count = (remaining.saturating_sub(4) / per_segment_cost) as u32;
    if segment_count == 0 {
        return Err(Error::InvalidArgument("device too small for a single segment"));
    }

    let index_offset = SUPERBLOCK_REGION_SIZE;
    let segstate_offset = index_offset + index_size;
    let segstate_size = u64::from(segment_count) * STATE_RECORD_LEN as u64 + 4;
    let meta_size = segstate_offset + segstate_size;

    Ok(Layout {
        table_size,
        segment_count,
        index_offset,
        segstate_offset,
        meta_size,
    })
}

/// A disk-resident key-value store.
#[derive(Clone)]
pub struct Store(Arc<Inner>);

impl std::ops::Deref for Store {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[doc(hidden)]
pub struct Inner {
    device: Arc<dyn BlockDevice>,
    meta_size: u64,
    index_offset: u64,
    segstate_offset: u64,
    segment_size: u32,

    superblock: Arc<SuperBlockManager>,
    index: Arc<IndexTable>,
    segment_manager: Arc<SegmentManager>,
    cache: ValueCache,

    pipeline: Arc<WritePipeline>,
    pipeline_threads: Mutex<Option<PipelineThreads>>,

    gc: Arc<GcManager>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,

    closed: AtomicBool,
}

impl Store {
    /// Formats a brand-new store over an already-sized device at `path`.
    ///
    /// # Errors
    /// Returns `Err` if the device is too small for the requested geometry
    /// or an I/O error occurs.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(path)?);
        Self::format(device, config)
    }

    /// Convenience for tests/benches: creates the backing file at `path`
    /// sized to exactly `device_size` bytes, then formats it.
    pub fn create_preallocated<P: AsRef<Path>>(
        path: P,
        device_size: u64,
        config: Config,
    ) -> Result<Self> {
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::create(path, device_size)?);
        Self::format(device, config)
    }

    fn format(device: Arc<dyn BlockDevice>, config: Config) -> Result<Self> {
        if config.segment_size == 0 || config.segment_size % crate::config::MIN_SEGMENT_SIZE != 0 {
            return Err(Error::InvalidArgument(
                "segment_size must be a nonzero multiple of MIN_SEGMENT_SIZE",
            ));
        }

        let device_size = device.len()?;
        let layout = layout_for(device_size, config.hash_table_size, config.segment_size)?;

        let sb = SuperBlock {
            hash_table_size: layout.table_size,
            element_count: 0,
            tombstone_count: 0,
            segment_size: config.segment_size,
            segment_count: layout.segment_count,
            current_segment_id: NO_SEGMENT,
            sb_size: SUPERBLOCK_REGION_SIZE,
            index_size: layout.segstate_offset - layout.index_offset,
            data_size: u64::from(layout.segment_count) * u64::from(config.segment_size),
            device_size,
        };

        let superblock = SuperBlockManager::new(sb);
        superblock.persist(device.as_ref())?;

        let index = IndexTable::new(layout.table_size, config.probe_limit);
        index.persist(device.as_ref(), layout.index_offset)?;

        let segment_manager = SegmentManager::new(
            layout.segment_count,
            config.segment_size,
            GC_RESERVE_SEGMENTS,
        );
        segment_manager.persist(device.as_ref(), layout.segstate_offset)?;

        device.sync()?;

        log::info!(
            "formatted store: {} segments x {} bytes, hash table size {}",
            layout.segment_count,
            config.segment_size,
            layout.table_size
        );

        Ok(Self::assemble(
            device,
            layout.meta_size,
            layout.index_offset,
            layout.segstate_offset,
            config,
            superblock,
            Arc::new(index),
            Arc::new(segment_manager),
        ))
    }

    /// Opens an existing store, recovering the hash index by segment scan if
    /// its persisted checksum does not verify (`spec.md` §4.2, §7).
    ///
    /// `config` supplies the runtime tunables (`probe_limit`, `expired_time_us`,
    /// GC thresholds); `hash_table_size`/`segment_size` are always taken from
    /// the persisted superblock, since those are fixed at create time.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(path)?);

        let superblock = SuperBlockManager::load(device.as_ref())?;
        let sb = superblock.snapshot();

        let index_offset = SUPERBLOCK_REGION_SIZE;
        let segstate_offset = index_offset + sb.index_size;

        let segment_manager = SegmentManager::load(
            device.as_ref(),
            segstate_offset,
            sb.segment_count,
            sb.segment_size,
            GC_RESERVE_SEGMENTS,
        )?;

        let meta_size = segstate_offset + (u64::from(sb.segment_count) * STATE_RECORD_LEN as u64 + 4);

        let index = match IndexTable::load(
            device.as_ref(),
            index_offset,
            sb.hash_table_size,
            config.probe_limit,
        ) {
            Ok(table) => table,
            Err(Error::Corrupt(reason)) => {
                log::warn!("hash index checksum invalid ({reason}), rebuilding by segment scan");
                rebuild_index_from_segments(
                    device.as_ref(),
                    meta_size,
                    &segment_manager,
                    sb.hash_table_size,
                    sb.segment_size,
                    config.probe_limit,
                )?
            }
            Err(err) => return Err(err),
        };

        Ok(Self::assemble(
            device,
            meta_size,
            index_offset,
            segstate_offset,
            config,
            superblock,
            Arc::new(index),
            Arc::new(segment_manager),
        ))
    }

    fn assemble(
        device: Arc<dyn BlockDevice>,
        meta_size: u64,
        index_offset: u64,
        segstate_offset: u64,
        config: Config,
        superblock: SuperBlockManager,
        index: Arc<IndexTable>,
        segment_manager: Arc<SegmentManager>,
    ) -> Self {
        let segment_size = config.segment_size;
        let superblock = Arc::new(superblock);

        let pipeline = WritePipeline::new(
            Arc::clone(&device),
            meta_size,
            segment_size,
            Arc::clone(&segment_manager),
            Arc::clone(&superblock),
            Duration::from_micros(config.expired_time_us),
        );
        let pipeline_threads = pipeline.spawn();

        let thresholds = GcThresholds {
            background_trigger: config.gc_background_trigger,
            background_utilization: config.gc_background_utilization,
            foreground_utilization: config.gc_foreground_utilization,
            full_utilization: config.gc_full_utilization,
            background_interval: Duration::from_micros(config.gc_background_interval_us),
        };
        let gc = GcManager::new(
            Arc::clone(&device),
            meta_size,
            segment_size,
            Arc::clone(&segment_manager),
            Arc::clone(&index),
            thresholds,
        );
        pipeline.set_gc(Arc::clone(&gc));
        let gc_thread = gc.spawn();

        let cache = ValueCache::with_capacity_bytes(config.value_cache_bytes);

        Self(Arc::new(Inner {
            device,
            meta_size,
            index_offset,
            segstate_offset,
            segment_size,
            superblock,
            index,
            segment_manager,
            cache,
            pipeline,
            pipeline_threads: Mutex::new(Some(pipeline_threads)),
            gc,
            gc_thread: Mutex::new(Some(gc_thread)),
            closed: AtomicBool::new(false),
        }))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument("store is closed"));
        }
        Ok(())
    }

    /// Reads the record header at `entry`'s location to learn its exact
    /// on-disk size, for [`crate::segment::manager::SegmentManager::modify_death_entry`].
    /// The index stores only `value_len`, not `key_len`, so the record size
    /// of a superseded entry can only be recovered by reading it back.
    fn record_size_of(&self, entry: &crate::index::HashEntry) -> Result<u32> {
        let offset = segment::segment_offset(self.meta_size, self.segment_size, entry.segment_id)
            + u64::from(entry.offset);
        let mut header_buf = [0u8; RecordHeader::ENCODED_LEN];
        self.device.read_at(&mut header_buf, offset)?;
        let header = RecordHeader::decode(&header_buf)?;
        Ok(header.total_len() as u32)
    }

    fn put_at(&self, key: &[u8], value: &[u8], timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument("key is empty or exceeds maximum length"));
        }

        let digest = KeyDigest::compute(key);
        let request = self
            .pipeline
            .enqueue(digest, Slice::new(key), Slice::new(value), timestamp)?;
        let placement = request.wait()?;

        let (op, old) = self.index.update(NewEntry {
            digest,
            segment_id: placement.segment_id,
            offset: placement.offset,
            value_len: value.len() as u32,
            timestamp,
        })?;
        self.superblock.apply_op(op);
        self.cache.invalidate(&digest);

        if let Some(old_entry) = old {
            if let Ok(record_size) = self.record_size_of(&old_entry) {
                self.segment_manager
                    .modify_death_entry(old_entry.segment_id, record_size);
            }
        }

        Ok(())
    }

    /// Inserts or overwrites `key` with `value`.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or oversize key or a closed store,
    /// `NoSpace`/`TableFull` if the store cannot accommodate the write.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_at(key, value, now_micros())
    }

    /// Deletes `key`; implemented as `put(key, &[])`, per `spec.md` §9's
    /// "empty value = delete" resolution.
    ///
    /// # Errors
    /// Same as [`Self::put`].
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.put_at(key, &[], now_micros())
    }

    /// Looks up `key`, checking the value cache before the hash index.
    ///
    /// # Errors
    /// `InvalidArgument` if the store is closed; I/O errors reading the
    /// underlying device.
    pub fn get(&self, key: &[u8]) -> Result<Option<Slice>> {
        self.ensure_open()?;

        let digest = KeyDigest::compute(key);
        if let Some(cached) = self.cache.get(&digest) {
            return Ok(Some(cached));
        }

        let Some(entry) = self.index.get(digest) else {
            return Ok(None);
        };

        let offset = segment::segment_offset(self.meta_size, self.segment_size, entry.segment_id)
            + u64::from(entry.offset);
        let mut header_buf = [0u8; RecordHeader::ENCODED_LEN];
        self.device.read_at(&mut header_buf, offset)?;
        let header = RecordHeader::decode(&header_buf)?;

        let mut body = vec![0u8; header.key_len as usize + header.value_len as usize];
        self.device
            .read_at(&mut body, offset + RecordHeader::ENCODED_LEN as u64)?;
        let value = Slice::new(&body[header.key_len as usize..]);

        self.cache.insert(digest, value.clone());
        Ok(Some(value))
    }

    /// Triggers a synchronous full GC pass (`spec.md` §4.5 `FullGC`).
    ///
    /// # Errors
    /// Propagates I/O or corruption errors encountered while compacting.
    pub fn do_gc(&self) -> Result<u32> {
        self.ensure_open()?;
        self.gc.full_gc()
    }

    /// A snapshot of the superblock's current counters and geometry.
    #[must_use]
    pub fn stats(&self) -> SuperBlock {
        self.superblock.snapshot()
    }

    /// Flushes metadata and stops background threads. The DB must be
    /// considered inconsistent if this returns `Err` (`spec.md` §6).
    ///
    /// # Errors
    /// Propagates I/O errors from the final metadata persist.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.pipeline.force_rollover();
        self.pipeline.stop();
        if let Some(mut threads) = self.pipeline_threads.lock().expect("lock is poisoned").take() {
            threads.join();
        }

        self.gc.stop();
        if let Some(handle) = self.gc_thread.lock().expect("lock is poisoned").take() {
            let _ = handle.join();
        }

        self.superblock.persist(self.device.as_ref())?;
        self.index.persist(self.device.as_ref(), self.index_offset)?;
        self.segment_manager
            .persist(self.device.as_ref(), self.segstate_offset)?;
        self.device.sync()?;

        log::info!("store closed cleanly");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.pipeline.force_rollover();
            self.pipeline.stop();
            if let Some(mut threads) = self.pipeline_threads.lock().expect("lock is poisoned").take() {
                threads.join();
            }
            self.gc.stop();
            if let Some(handle) = self.gc_thread.lock().expect("lock is poisoned").take() {
                let _ = handle.join();
            }
        }
    }
}

/// Segment-scan recovery: replays every `Used` segment's records into a
/// fresh table, honoring timestamps (`spec.md` §4.2, §7).
fn rebuild_index_from_segments(
    device: &dyn BlockDevice,
    meta_size: u64,
    segment_manager: &SegmentManager,
    table_size: u32,
    segment_size: u32,
    probe_limit: u32,
) -> Result<IndexTable> {
    let mut records = Vec::new();

    for id in 0..segment_manager.segment_count() {
        if segment_manager.state_of(id) != SegmentState::Used {
            continue;
        }

        let offset = segment::segment_offset(meta_size, segment_size, id);
        let mut image = vec![0u8; segment_size as usize];
        device.read_at(&mut image, offset)?;

        let seg_header = SegHeader::decode(&image[..SegHeader::ENCODED_LEN])?;
        let parsed = parse_payload(&seg_header, &image[SegHeader::ENCODED_LEN..])?;

        for record in parsed {
            records.push(NewEntry {
                digest: record.header.digest,
                segment_id: id,
                offset: record.header.offset,
                value_len: record.header.value_len,
                timestamp: record.header.timestamp,
            });
        }
    }

    // Segments are scanned in ascending id order, not write order - the
    // round-robin allocator can hand a key's delete a lower segment id
    // than its original insert once the cursor wraps. Replay must honor
    // `timestamp` order or a tombstone can be overtaken by the stale
    // insert it was meant to supersede, resurrecting a deleted key.
    records.sort_unstable_by_key(|record| record.timestamp);

    log::info!("segment-scan recovery replaying {} records", records.len());
    IndexTable::rebuild_from_records(table_size, probe_limit, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn config() -> Config {
        Config::new(31, crate::config::MIN_SEGMENT_SIZE).expired_time_us(500)
    }

    fn open_store(dir: &tempfile::TempDir, segments: u32) -> Store {
        let path = dir.path().join("store.db");
        let device_size = u64::from(segments) * u64::from(crate::config::MIN_SEGMENT_SIZE) + 64 * 1_024;
        Store::create_preallocated(&path, device_size, config()).expect("store formats")
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 4);

        store.put(b"a", b"1").unwrap();
        let value = store.get(b"a").unwrap().unwrap();
        assert_eq!(&*value, b"1");

        store.close().unwrap();
    }

    #[test]
    fn overwrite_then_get_returns_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 4);

        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(&*store.get(b"k").unwrap().unwrap(), b"v2");
        assert_eq!(store.stats().element_count, 1);

        store.close().unwrap();
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 4);

        store.put(b"k", b"v").unwrap();
        store.delete(b"k").unwrap();
        assert!(store.get(b"k").unwrap().is_none());

        let stats = store.stats();
        assert_eq!(stats.element_count, 0);
        assert_eq!(stats.tombstone_count, 1);

        store.close().unwrap();
    }

    #[test]
    fn durable_after_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let device_size = 4 * u64::from(crate::config::MIN_SEGMENT_SIZE) + 64 * 1_024;

        {
            let store = Store::create_preallocated(&path, device_size, config()).unwrap();
            store.put(b"a", b"1").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path, config()).unwrap();
        assert_eq!(&*store.get(b"a").unwrap().unwrap(), b"1");
        store.close().unwrap();
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 4);
        let result = store.put(b"", b"v");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        store.close().unwrap();
    }

    #[test]
    fn operations_after_close_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 4);
        store.close().unwrap();
        assert!(matches!(store.put(b"a", b"1"), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.get(b"a"), Err(Error::InvalidArgument(_))));
    }

    /// Writes one record as a complete segment image at `id`, computing the
    /// same self-referential in-segment offset `OpenSegment::write_to_device`
    /// would, so the image is indistinguishable from one the write pipeline
    /// produced.
    fn write_single_record_segment(
        device: &FileDevice,
        meta_size: u64,
        segment_size: u32,
        id: u32,
        digest: KeyDigest,
        key: &[u8],
        value: &[u8],
        timestamp: u64,
    ) {
        let in_segment_offset = SegHeader::ENCODED_LEN as u32;
        let header = RecordHeader {
            digest,
            key_len: key.len() as u32,
            value_len: value.len() as u32,
            offset: in_segment_offset,
            timestamp,
        };
        let mut payload = Vec::new();
        header.encode(&mut payload);
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);

        let seg_header = SegHeader {
            record_count: 1,
            payload_len: payload.len() as u32,
            payload_crc32: crc32fast::hash(&payload),
        };

        let mut image = Vec::with_capacity(segment_size as usize);
        image.extend_from_slice(&seg_header.encode());
        image.extend_from_slice(&payload);
        image.resize(segment_size as usize, 0);

        let offset = segment::segment_offset(meta_size, segment_size, id);
        device.write_at(&image, offset).unwrap();
    }

    #[test]
    fn segment_scan_recovery_replays_in_timestamp_order_not_segment_order() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments.bin");
        let segment_size = crate::config::MIN_SEGMENT_SIZE;
        let meta_size = 0u64;
        let device = FileDevice::create(&path, 2 * u64::from(segment_size))?;
        let digest = KeyDigest::compute(b"a");

        // Segment 0 holds the newer record (the delete); segment 1 the
        // older one (the original insert). Ascending segment-id iteration
        // would replay the delete first - dropped into an empty slot as a
        // `Noop` - then the stale insert, resurrecting the key. A normal
        // round-robin allocation cursor can produce exactly this layout
        // once it wraps around.
        write_single_record_segment(&device, meta_size, segment_size, 0, digest, b"a", b"", 2);
        write_single_record_segment(&device, meta_size, segment_size, 1, digest, b"a", b"hello", 1);

        let segment_manager = SegmentManager::new(2, segment_size, 0);
        segment_manager.mark_used(0, 0);
        segment_manager.mark_used(1, 0);

        let table = rebuild_index_from_segments(&device, meta_size, &segment_manager, 97, segment_size, 16)?;
        assert!(
            table.get(digest).is_none(),
            "segment-scan recovery must not resurrect a deleted key"
        );
        Ok(())
    }
}
