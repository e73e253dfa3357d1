//! Prometheus metrics for the delivery engine.
//!
//! # Example
//!
//! ```ignore
//! use notify_queue::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("delivered", "single", 0.12);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, REGISTRY, TASKS_IN_FLIGHT, TASKS_TOTAL, TASK_DURATION,
};
