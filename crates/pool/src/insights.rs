//! Non-blocking pool counter snapshots.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time snapshot of a pool's counters.
///
/// Safe to take while work is running; the values are independently-read
/// atomics, not a consistent cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInsights {
    /// Maximum concurrent runners.
    pub bandwidth: usize,
    /// Runners currently executing.
    pub in_progress: usize,
    /// Workers blocked on the throttler.
    pub waiting: usize,
    /// Jobs enqueued but not yet picked up.
    pub job_queue: usize,
    /// Errors awaiting the error handler.
    pub err_queue: usize,
    /// Upstream results awaiting the feed worker.
    pub feed_queue: usize,
    /// Groups still accumulating results.
    pub groups: usize,
}

/// Atomics behind [`PoolInsights`], shared by every worker of one pool.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) in_progress: AtomicUsize,
    pub(crate) waiting: AtomicUsize,
    pub(crate) queued_jobs: AtomicUsize,
    pub(crate) queued_errs: AtomicUsize,
}

impl PoolCounters {
    pub(crate) fn reset(&self) {
        self.in_progress.store(0, Ordering::Relaxed);
        self.waiting.store(0, Ordering::Relaxed);
        self.queued_jobs.store(0, Ordering::Relaxed);
        self.queued_errs.store(0, Ordering::Relaxed);
    }
}

pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Saturating decrement; queue counters can lag their channels around a
/// flush and must never wrap.
pub(crate) fn decr(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

pub(crate) fn read(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::Relaxed)
}
