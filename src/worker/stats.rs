//! In-process worker statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Point-in-time snapshot of one worker process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub running: bool,
    /// Configured number of processors.
    pub concurrent_workers: usize,
    /// Processors currently executing a task.
    pub active_workers: usize,
    pub main_channel_depth: usize,
    pub main_channel_capacity: usize,
    pub retry_channel_depth: usize,
    pub retry_channel_capacity: usize,
    pub delivered: u64,
    /// Failed attempts, whatever happened to the task next.
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Malformed tasks discarded without processing.
    pub dropped: u64,
    pub average_task_duration: Duration,
}

impl WorkerStats {
    /// Tasks that reached a terminal state in this process.
    pub fn terminal(&self) -> u64 {
        self.delivered + self.dead_lettered + self.dropped
    }

    /// Delivered share of attempts, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.delivered + self.failed;
        if attempts == 0 {
            return 0.0;
        }
        (self.delivered as f64 / attempts as f64) * 100.0
    }
}

/// Shared counters updated by every loop.
#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedStats {
    pub(crate) fn record_delivery(&self, duration: Duration) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn active(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst) as usize
    }

    /// Fills the counter fields of `stats`.
    pub(crate) fn fill(&self, stats: &mut WorkerStats) {
        let delivered = self.delivered.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let attempts = delivered + failed;

        stats.active_workers = self.active();
        stats.delivered = delivered;
        stats.failed = failed;
        stats.retried = self.retried.load(Ordering::SeqCst);
        stats.dead_lettered = self.dead_lettered.load(Ordering::SeqCst);
        stats.dropped = self.dropped.load(Ordering::SeqCst);
        stats.average_task_duration = if attempts > 0 {
            Duration::from_millis(total_ms / attempts)
        } else {
            Duration::ZERO
        };
    }
}
