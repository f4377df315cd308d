// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A caller's pending write, waiting on the segment writer thread.
//!
//! Grounded on `examples/original_source/src/Kvdb_Impl.cc`'s per-request
//! completion handling inside `enqueReqs`/`SegWriteThdEntry`, reimplemented
//! with the teacher's `std::sync::{Mutex, Condvar}` +
//! `.expect("lock is poisoned")` idiom.

use std::sync::{Condvar, Mutex};

/// Where a request's record ended up once its segment was durably written.
#[derive(Clone, Copy, Debug)]
pub struct Placement {
    pub segment_id: u32,
    pub offset: u32,
}

/// Why a request's segment never made it to disk.
///
/// Distinguished so `Request::wait` can surface `Error::NoSpace` rather than
/// a generic I/O error when allocation (not the write itself) is what
/// failed, per `spec.md` §7 ("`NoSpace` surfaces to the caller only after
/// ForeGC fails").
#[derive(Clone, Copy, Debug)]
pub enum FailureReason {
    NoSpace,
    WriteFailed(&'static str),
}

#[derive(Debug)]
enum RequestState {
    Pending,
    Succeeded(Placement),
    Failed(FailureReason),
}

/// A single caller's write, enqueued into an [`crate::segment::open::OpenSegment`]
/// and later resolved by the segment writer thread.
///
/// `spec.md` §5: "`get` never waits on the writer... until then, reads of
/// an in-flight key return not found" - `put`/`delete` callers, in
/// contrast, block here until the writer resolves the segment they landed
/// in.
#[derive(Debug)]
pub struct Request {
    state: Mutex<RequestState>,
    cv: Condvar,
}

impl Request {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RequestState::Pending),
            cv: Condvar::new(),
        }
    }

    /// Called by the writer thread once the owning segment was written.
    pub fn resolve_success(&self, placement: Placement) {
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = RequestState::Succeeded(placement);
        self.cv.notify_all();
    }

    /// Called by the writer thread when the owning segment never made it to disk.
    pub fn resolve_failure(&self, reason: FailureReason) {
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = RequestState::Failed(reason);
        self.cv.notify_all();
    }

    /// Blocks the calling (user) thread until the writer thread resolves
    /// this request's segment.
    pub fn wait(&self) -> crate::Result<Placement> {
        let mut state = self.state.lock().expect("lock is poisoned");
        while matches!(*state, RequestState::Pending) {
            state = self.cv.wait(state).expect("lock is poisoned");
        }
        match *state {
            RequestState::Succeeded(placement) => Ok(placement),
            RequestState::Failed(FailureReason::NoSpace) => Err(crate::Error::NoSpace),
            RequestState::Failed(FailureReason::WriteFailed(reason)) => {
                Err(crate::Error::Io(std::io::Error::other(reason)))
            }
            RequestState::Pending => unreachable!("loop only exits once resolved"),
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use test_log::test;

    #[test]
    fn wait_blocks_until_resolved_success() {
        let request = Arc::new(Request::new());
        let waiter = Arc::clone(&request);

        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(std::time::Duration::from_millis(10));
        request.resolve_success(Placement {
            segment_id: 3,
            offset: 128,
        });

        let placement = handle.join().unwrap().expect("resolved ok");
        assert_eq!(placement.segment_id, 3);
        assert_eq!(placement.offset, 128);
    }

    #[test]
    fn wait_surfaces_failure() {
        let request = Request::new();
        request.resolve_failure(FailureReason::WriteFailed("device write failed"));
        let result = request.wait();
        assert!(matches!(result, Err(crate::Error::Io(_))));
    }

    #[test]
    fn wait_surfaces_no_space() {
        let request = Request::new();
        request.resolve_failure(FailureReason::NoSpace);
        let result = request.wait();
        assert!(matches!(result, Err(crate::Error::NoSpace)));
    }
}
