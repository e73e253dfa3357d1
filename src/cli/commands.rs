//! CLI command definitions for notify-queue.
//!
//! `worker` runs a delivery worker until Ctrl-C; the other commands are
//! administrative operations against the same Redis queues.

use crate::config::{QueueKeys, WorkerConfig, DEFAULT_KEY_PREFIX};
use crate::delivery::LogDelivery;
use crate::manager::QueueManager;
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::Placement;
use crate::store::{QueueStore, RedisStore};
use crate::task::Task;
use crate::worker::NotificationWorker;
use anyhow::Context;
use clap::Parser;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default Redis connection URL.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Notification delivery engine.
#[derive(Parser)]
#[command(name = "notify-queue")]
#[command(about = "Durable notification delivery worker and queue administration")]
#[command(version)]
#[command(
    long_about = "notify-queue runs notification delivery workers over Redis-backed queues and administers those queues.\n\nExample usage:\n  notify-queue worker --concurrency 8\n  notify-queue submit --file task.json\n  notify-queue stats --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "NOTIFY_REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Prefix of every queue key.
    #[arg(long, env = "NOTIFY_QUEUE_PREFIX", default_value = DEFAULT_KEY_PREFIX, global = true)]
    pub prefix: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a delivery worker until interrupted.
    Worker(WorkerArgs),

    /// Submit a task given as JSON.
    Submit(SubmitArgs),

    /// Show queue depths and worker counts.
    Stats(StatsArgs),

    /// Delete every queue (main, retry, scheduled, dead letter, processing).
    Purge(PurgeArgs),

    /// Move dead-lettered tasks back to the main queue.
    Requeue(RequeueArgs),

    /// Show dead-lettered tasks without removing them.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// List registered workers.
    Workers(JsonArgs),
}

/// Arguments for `notify-queue worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker identity. Generated when omitted.
    #[arg(long, env = "NOTIFY_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Number of concurrent task processors.
    #[arg(short = 'c', long, env = "NOTIFY_CONCURRENCY", default_value = "5")]
    pub concurrency: usize,

    /// Per-task deadline in seconds.
    #[arg(long, env = "NOTIFY_PROCESSING_TIMEOUT_SECS", default_value = "30")]
    pub processing_timeout_secs: u64,

    /// Base retry delay in seconds.
    #[arg(long, env = "NOTIFY_RETRY_DELAY_SECS", default_value = "5")]
    pub retry_delay_secs: u64,

    /// Failed attempts allowed before dead-lettering.
    #[arg(long, env = "NOTIFY_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

impl WorkerArgs {
    fn to_config(&self, prefix: &str) -> WorkerConfig {
        let config = match &self.worker_id {
            Some(id) => WorkerConfig::new(id.clone(), prefix),
            None => WorkerConfig::with_generated_id(prefix),
        };
        config
            .with_concurrent_workers(self.concurrency)
            .with_processing_timeout(Duration::from_secs(self.processing_timeout_secs))
            .with_retry_delay(Duration::from_secs(self.retry_delay_secs))
            .with_max_retries(self.max_retries)
    }
}

/// Arguments for `notify-queue submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Task JSON. Mutually exclusive with --file.
    #[arg(conflicts_with = "file", required_unless_present = "file")]
    pub task: Option<String>,

    /// Read the task JSON from a file.
    #[arg(short = 'f', long)]
    pub file: Option<String>,

    /// Retry ceiling applied when the task does not set one.
    #[arg(long, env = "NOTIFY_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,
}

/// Arguments for `notify-queue stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Heartbeat age in seconds beyond which a worker is not counted as live.
    #[arg(long, default_value = "90")]
    pub worker_ttl_secs: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `notify-queue purge`.
#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Confirm the deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Arguments for `notify-queue requeue`.
#[derive(Parser, Debug)]
pub struct RequeueArgs {
    /// Maximum number of tasks to move.
    #[arg(short = 'n', long, default_value = "100")]
    pub limit: usize,
}

/// Arguments for `notify-queue dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of tasks to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments shared by read-only listings.
#[derive(Parser, Debug)]
pub struct JsonArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run an already parsed command line.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = Arc::new(
        RedisStore::connect(&cli.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", cli.redis_url))?,
    );
    let keys = QueueKeys::new(&cli.prefix);

    match cli.command {
        Commands::Worker(args) => run_worker_command(args, store, &cli.prefix).await?,
        Commands::Submit(args) => run_submit_command(args, manager(store, keys)).await?,
        Commands::Stats(args) => {
            let manager = manager(store, keys)
                .with_worker_ttl(Duration::from_secs(args.worker_ttl_secs));
            run_stats_command(args, manager).await?
        }
        Commands::Purge(args) => run_purge_command(args, manager(store, keys)).await?,
        Commands::Requeue(args) => run_requeue_command(args, manager(store, keys)).await?,
        Commands::DeadLetters(args) => {
            run_dead_letters_command(args, manager(store, keys)).await?
        }
        Commands::Workers(args) => run_workers_command(args, manager(store, keys)).await?,
    }
    Ok(())
}

fn manager(store: Arc<RedisStore>, keys: QueueKeys) -> QueueManager {
    QueueManager::new(store, keys)
}

async fn run_worker_command(
    args: WorkerArgs,
    store: Arc<RedisStore>,
    prefix: &str,
) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to register metrics");
    }

    store.ping().await.context("redis is not reachable")?;

    let config = args.to_config(prefix);
    info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrent_workers,
        prefix = prefix,
        "Starting worker"
    );

    let mut worker = NotificationWorker::new(config, store, Arc::new(LogDelivery));
    worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let result = worker.stop().await;

    let stats = worker.stats();
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        dropped = stats.dropped,
        "Worker totals"
    );

    if args.print_metrics {
        println!("{}", export_metrics());
    }

    result.map_err(Into::into)
}

async fn run_submit_command(args: SubmitArgs, manager: QueueManager) -> anyhow::Result<()> {
    let raw = match (&args.task, &args.file) {
        (_, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?
        }
        (Some(json), None) => json.clone(),
        (None, None) => anyhow::bail!("either a task JSON argument or --file is required"),
    };

    let task = Task::from_json(&raw).context("invalid task JSON")?;
    task.validate().context("task rejected")?;

    let (task, placement) = manager.submit(task, args.max_retries).await?;
    match placement {
        Placement::Immediate => println!("Queued task {}", task.id),
        Placement::Scheduled => println!(
            "Scheduled task {} for {}",
            task.id,
            task.scheduled_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default()
        ),
    }
    Ok(())
}

async fn run_stats_command(args: StatsArgs, manager: QueueManager) -> anyhow::Result<()> {
    let stats = manager.stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\n=== Queue Stats ===");
    println!("Main:           {}", stats.main);
    println!("Retry:          {}", stats.retry);
    println!("Scheduled:      {}", stats.scheduled);
    println!("Processing:     {}", stats.processing);
    println!("Dead letter:    {}", stats.dead_letter);
    println!(
        "Workers:        {} registered, {} live",
        stats.registered_workers, stats.live_workers
    );
    Ok(())
}

async fn run_purge_command(args: PurgeArgs, manager: QueueManager) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!("purge deletes every queued task; pass --yes to confirm");
    }
    manager.purge().await?;
    println!("All queues purged");
    Ok(())
}

async fn run_requeue_command(args: RequeueArgs, manager: QueueManager) -> anyhow::Result<()> {
    let count = manager.requeue_dead_letters(args.limit).await?;
    println!("Requeued {} dead-lettered task(s)", count);
    Ok(())
}

async fn run_dead_letters_command(
    args: DeadLettersArgs,
    manager: QueueManager,
) -> anyhow::Result<()> {
    let tasks = manager.dead_letters(args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No dead-lettered tasks");
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{}  {:<12} attempts={}  created={}  error={}",
            task.id,
            task.payload.base_type(),
            task.attempt_count,
            task.created_at.to_rfc3339(),
            task.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_workers_command(args: JsonArgs, manager: QueueManager) -> anyhow::Result<()> {
    let workers = manager.workers().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
        return Ok(());
    }

    if workers.is_empty() {
        println!("No registered workers");
        return Ok(());
    }
    for worker in &workers {
        println!(
            "{}  {:?}  concurrency={}  heartbeat={}  channels={}/{}",
            worker.worker_id,
            worker.status,
            worker.concurrency,
            worker.last_heartbeat.to_rfc3339(),
            worker.main_channel_depth,
            worker.retry_channel_depth
        );
    }
    Ok(())
}
