//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has been called, so library
//! users that do not scrape metrics pay nothing.

use super::prometheus::{ACTIVE_WORKERS, QUEUE_DEPTH, TASKS_IN_FLIGHT, TASKS_TOTAL, TASK_DURATION};

/// Metrics collector for delivery engine events.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one task attempt.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "delivered", "retried", "dead_lettered" or "dropped"
    /// * `task_type` - Base task type of the payload (e.g., "single", "bulk")
    /// * `duration_secs` - Attempt duration; ignored for dropped tasks
    pub fn record_task(&self, outcome: &str, task_type: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome, task_type]).inc();
        }

        if outcome != "dropped" {
            if let Some(task_duration) = TASK_DURATION.get() {
                task_duration
                    .with_label_values(&[task_type])
                    .observe(duration_secs);
            }
        }

        tracing::trace!(
            outcome = outcome,
            task_type = task_type,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Update the depth gauge of one queue.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    pub fn update_in_flight(&self, count: usize) {
        if let Some(in_flight) = TASKS_IN_FLIGHT.get() {
            in_flight.set(count as f64);
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}
