// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, single-node, append-structured key-value store over a raw
//! block device (or a plain file standing in for one).
//!
//! On-disk, a store is one fixed layout:
//!
//! `SuperBlock | Hash Table | Segment-State Table | Segment 0..N-1`
//!
//! Writes are aggregated in memory into a segment-sized buffer, which the
//! background writer thread flushes to its assigned segment in one shot;
//! segments are write-once, and only ever reclaimed wholesale by garbage
//! collection. The hash index maps each key's digest to its most recent
//! record's segment and offset; reads never wait on the writer, so a
//! key's write is not visible for lookups until its segment lands on disk.
//!
//! As keys are overwritten or deleted, space in their original segments
//! goes dead; [`Store::do_gc`] (and the background/foreground GC threads
//! started by [`Store::open`]) relocate live records out of
//! poorly-utilized segments and free the rest.
//!
//! # Example usage
//!
//! ```
//! use segkv::{Config, Store};
//!
//! # fn main() -> segkv::Result<()> {
//! # let dir = tempfile::tempdir()?;
//! # let path = dir.path().join("store.bin");
//! let store = Store::create_preallocated(&path, 16 * 1_024 * 1_024, Config::new(1_024, 256 * 1_024))?;
//!
//! store.put(b"a", b"hello")?;
//! assert_eq!(&*store.get(b"a")?.unwrap(), b"hello");
//!
//! store.delete(b"a")?;
//! assert!(store.get(b"a")?.is_none());
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod cache;
mod config;
mod db;
mod device;
mod digest;
mod error;
mod gc;
mod index;
mod pipeline;
mod request;
mod segment;
mod slice;
mod superblock;
mod version;

pub use {
    cache::ValueCache,
    config::{Config, MIN_SEGMENT_SIZE},
    db::{Store, MAX_KEY_LEN},
    device::{BlockDevice, FileDevice},
    error::{Error, Result},
    slice::Slice,
    superblock::SuperBlock,
    version::Version,
};
