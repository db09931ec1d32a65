//! Monotonic counters shared by every task of a search.
//!
//! All of these are read by the per-iteration report while the tree is still
//! being hammered by concurrent queries, so they are plain atomics with
//! relaxed ordering. Nothing synchronises through them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    /// Calls to `queryall`, cached or not.
    pub queryall: AtomicU64,

    /// `queryall` calls that missed the local table and went to the remote.
    pub uncached: AtomicU64,

    /// Positions the remote did not know and that we asked it to queue.
    pub enqueued: AtomicU64,

    /// Positions re-queued because the remote returned too few scored moves.
    pub requeued: AtomicU64,

    /// Moves without a remote score that we probed or searched anyway.
    pub unscored: AtomicU64,

    /// Queryalls issued while walking a PV back to the root.
    pub reprobe_queryall: AtomicU64,

    /// HTTP requests currently in flight.
    pub inflight_requests: AtomicI64,

    /// Sum of `inflight_requests` sampled at every `queryall` entry.
    pub sum_inflight_requests: AtomicU64,

    /// Sum of `inflight_requests` sampled at every uncached fetch.
    pub sum_inflight_uncached: AtomicU64,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Add the current number of in-flight requests to an aggregate.
    pub fn sample_inflight(&self, into: &AtomicU64) {
        let inflight = self.inflight_requests.load(Ordering::Relaxed).max(0) as u64;
        into.fetch_add(inflight, Ordering::Relaxed);
    }
}
