//! Prometheus metrics registration and export.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global Prometheus registry for all notify-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task attempts by outcome (delivered, retried, dead_lettered, dropped) and task type.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Delivery attempt duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of entries per queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Entries in the processing hash.
pub static TASKS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Processors currently executing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("notify_tasks_total", "Task attempts by outcome"),
        &["outcome", "type"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "notify_task_duration_seconds",
            "Delivery attempt duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["type"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("notify_queue_depth", "Number of entries per queue"),
        &["queue"],
    )?;

    let tasks_in_flight = Gauge::new(
        "notify_tasks_in_flight",
        "Entries in the processing hash",
    )?;

    let active_workers = Gauge::new(
        "notify_active_workers",
        "Processors currently executing a task",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_flight.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_FLIGHT.set(tasks_in_flight);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
