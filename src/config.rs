// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Minimum segment size: one typical device sector.
pub const MIN_SEGMENT_SIZE: u32 = 4 * 1_024;

/// Store configuration.
///
/// Fields marked "create-time" are only consulted by [`crate::Store::create`]
/// and are otherwise recovered from the on-disk superblock; the rest are
/// runtime tunables that may differ between `open` calls on the same store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested hash table capacity (create-time). Rounded up to the next
    /// prime at create time; fixed for the life of the store afterwards.
    pub(crate) hash_table_size: u32,

    /// Segment size in bytes (create-time). Must be a multiple of
    /// [`MIN_SEGMENT_SIZE`].
    pub(crate) segment_size: u32,

    /// How long an open segment may sit non-empty before the timeout thread
    /// forces a rollover, in microseconds.
    pub(crate) expired_time_us: u64,

    /// Probe limit for the hash index's linear probing.
    pub(crate) probe_limit: u32,

    /// Fraction of segments that must be free before background GC stops
    /// triggering (e.g. 0.5 = trigger while fewer than half are free).
    pub(crate) gc_background_trigger: f32,

    /// Utilization threshold background GC compacts below.
    pub(crate) gc_background_utilization: f32,

    /// Utilization threshold foreground (allocation-failure) GC compacts below.
    pub(crate) gc_foreground_utilization: f32,

    /// Utilization threshold a full/manual GC pass compacts below.
    pub(crate) gc_full_utilization: f32,

    /// Interval between background GC sweeps, in microseconds.
    pub(crate) gc_background_interval_us: u64,

    /// Capacity in bytes of the in-memory hot-value read cache.
    pub(crate) value_cache_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_table_size: 1_024,
            segment_size: 4 * 1_024 * 1_024,
            expired_time_us: 2_000,
            probe_limit: 64,
            gc_background_trigger: 0.5,
            gc_background_utilization: 0.5,
            gc_foreground_utilization: 0.7,
            gc_full_utilization: 0.9,
            gc_background_interval_us: 1_000_000,
            value_cache_bytes: 8 * 1_024 * 1_024,
        }
    }
}

impl Config {
    /// Creates a new configuration builder with the given create-time geometry.
    #[must_use]
    pub fn new(hash_table_size: u32, segment_size: u32) -> Self {
        Self {
            hash_table_size,
            segment_size,
            ..Default::default()
        }
    }

    /// Sets how long an open segment may sit non-empty before being forced
    /// out by the timeout thread, in microseconds.
    ///
    /// Default = 2000
    #[must_use]
    pub fn expired_time_us(mut self, us: u64) -> Self {
        self.expired_time_us = us;
        self
    }

    /// Sets the hash index's linear probe limit.
    ///
    /// Default = 64
    #[must_use]
    pub fn probe_limit(mut self, limit: u32) -> Self {
        self.probe_limit = limit;
        self
    }

    /// Sets the free-segment ratio below which background GC considers
    /// running a pass.
    ///
    /// Default = 0.5
    #[must_use]
    pub fn gc_background_trigger(mut self, ratio: f32) -> Self {
        self.gc_background_trigger = ratio;
        self
    }

    /// Sets the utilization threshold background GC compacts segments below.
    ///
    /// Default = 0.5
    #[must_use]
    pub fn gc_background_utilization(mut self, ratio: f32) -> Self {
        self.gc_background_utilization = ratio;
        self
    }

    /// Sets the utilization threshold foreground GC compacts segments below.
    ///
    /// Default = 0.7
    #[must_use]
    pub fn gc_foreground_utilization(mut self, ratio: f32) -> Self {
        self.gc_foreground_utilization = ratio;
        self
    }

    /// Sets the utilization threshold a full GC pass compacts segments below.
    ///
    /// Default = 0.9
    #[must_use]
    pub fn gc_full_utilization(mut self, ratio: f32) -> Self {
        self.gc_full_utilization = ratio;
        self
    }

    /// Sets the interval between background GC sweeps, in microseconds.
    ///
    /// Default = 1_000_000 (1s)
    #[must_use]
    pub fn gc_background_interval_us(mut self, us: u64) -> Self {
        self.gc_background_interval_us = us;
        self
    }

    /// Sets the capacity in bytes of the in-memory hot-value read cache.
    ///
    /// Default = 8 MiB
    #[must_use]
    pub fn value_cache_bytes(mut self, bytes: u64) -> Self {
        self.value_cache_bytes = bytes;
        self
    }
}
