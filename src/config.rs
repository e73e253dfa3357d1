//! Worker configuration and store key layout.

use std::time::Duration;

use uuid::Uuid;

/// Default key prefix for every queue key.
pub const DEFAULT_KEY_PREFIX: &str = "notifications";

/// Store key names, all derived from one prefix.
///
/// The key space is operator-facing and must stay stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Main list of immediately deliverable tasks.
    pub main: String,
    /// List of tasks waiting for another attempt.
    pub retry: String,
    /// Sorted set of future tasks, scored by due Unix timestamp.
    pub scheduled: String,
    /// Insertion-ordered list of terminally failed tasks.
    pub dead_letter: String,
    /// Hash of in-flight tasks: task id -> processing entry.
    pub processing: String,
    /// Hash of registered workers: worker id -> heartbeat record.
    pub workers: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            main: format!("{}:queue", prefix),
            retry: format!("{}:retry", prefix),
            scheduled: format!("{}:scheduled", prefix),
            dead_letter: format!("{}:dead_letter", prefix),
            processing: format!("{}:processing", prefix),
            workers: format!("{}:workers", prefix),
        }
    }

    /// Keys removed by a purge. The worker registry is left intact.
    pub fn purgeable(&self) -> [&str; 5] {
        [
            &self.main,
            &self.retry,
            &self.scheduled,
            &self.dead_letter,
            &self.processing,
        ]
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Configuration for a notification worker.
///
/// There is no process-wide default identity: callers pass a worker id or
/// ask for a generated one with [`WorkerConfig::with_generated_id`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to the processing hash and worker registry.
    pub worker_id: String,
    /// Number of parallel task processors.
    pub concurrent_workers: usize,
    /// Capacity of the in-process main channel.
    pub main_channel_capacity: usize,
    /// Capacity of the in-process retry channel.
    pub retry_channel_capacity: usize,
    /// Store key names.
    pub keys: QueueKeys,
    /// Per-task deadline. A timeout counts as a delivery failure.
    pub processing_timeout: Duration,
    /// Seed for exponential retry backoff.
    pub retry_delay: Duration,
    /// Retries allowed before a task is dead-lettered.
    pub max_retries: u32,
    /// Heartbeat cadence for the worker registry.
    pub health_check_interval: Duration,
    /// Cadence of the stuck-task and dead-letter sweep.
    pub cleanup_interval: Duration,
    /// Cadence of the scheduled-set scan.
    pub scheduled_poll_interval: Duration,
    /// Timeout of each blocking pop against the store.
    pub pop_timeout: Duration,
    /// Sleep when neither list yielded work.
    pub idle_backoff: Duration,
    /// Grace period for in-flight tasks at shutdown.
    pub shutdown_timeout: Duration,
    /// Dead-lettered tasks older than this are trimmed.
    pub dead_letter_retention: Duration,
}

/// Shortest period accepted for the periodic loops.
pub const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(1);

impl WorkerConfig {
    /// Creates a configuration for an explicitly named worker.
    pub fn new(worker_id: impl Into<String>, key_prefix: &str) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrent_workers: 5,
            main_channel_capacity: 100,
            retry_channel_capacity: 50,
            keys: QueueKeys::new(key_prefix),
            processing_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            health_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            scheduled_poll_interval: Duration::from_secs(10),
            pop_timeout: Duration::from_secs(1),
            idle_backoff: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            dead_letter_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }

    /// Creates a configuration with a freshly generated worker identity.
    pub fn with_generated_id(key_prefix: &str) -> Self {
        Self::new(format!("worker-{}", Uuid::new_v4()), key_prefix)
    }

    pub fn with_concurrent_workers(mut self, workers: usize) -> Self {
        self.concurrent_workers = workers.max(1);
        self
    }

    pub fn with_channel_capacities(mut self, main: usize, retry: usize) -> Self {
        self.main_channel_capacity = main.max(1);
        self.retry_channel_capacity = retry.max(1);
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn with_scheduled_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduled_poll_interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_dead_letter_retention(mut self, retention: Duration) -> Self {
        self.dead_letter_retention = retention;
        self
    }

    /// Age after which a processing entry is considered stuck.
    pub fn stuck_threshold(&self) -> Duration {
        self.processing_timeout * 2
    }

    /// Age after which a worker heartbeat is considered stale.
    pub fn heartbeat_ttl(&self) -> Duration {
        self.health_check_interval * 3
    }
}
