//! CLI command definitions for packamal-scheduler.
//!
//! Every command reads its backends from the environment (see
//! [`SchedulerConfig::from_env`]); `--database-url` and `--redis-url` override
//! the corresponding variables.

use crate::config::SchedulerConfig;
use crate::scheduler::{
    AnalysisMode, AnalysisRequest, AnalysisTask, Ecosystem, Scheduler, TaskOptions, TaskStatus,
};
use crate::storage;
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of tasks listed by `status`.
const DEFAULT_LIST_LIMIT: u32 = 20;

/// Single-flight scheduler for containerized package analyses.
#[derive(Parser)]
#[command(name = "packamal-scheduler")]
#[command(about = "Queue, run and supervise package analyses one container at a time")]
#[command(version)]
#[command(
    long_about = "packamal-scheduler queues package analysis requests and runs them in the analysis container, one at a time.\n\nExample usage:\n  packamal-scheduler migrate\n  packamal-scheduler enqueue npm lodash --version 4.17.21\n  packamal-scheduler serve --workers 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Task store URL (sqlite://... or postgres://...).
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Redis URL for the result cache and dispatch queue.
    #[arg(long, env = "REDIS_URL", global = true, hide_env_values = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create or upgrade the task store schema.
    Migrate,

    /// Queue a package analysis.
    #[command(alias = "add")]
    Enqueue(EnqueueArgs),

    /// Run the worker pool and periodic jobs until interrupted.
    Serve(ServeArgs),

    /// Fail running tasks that exceeded their timeout, then dispatch the next one.
    SweepTimeouts(OutputArgs),

    /// Delete completed and failed tasks past the retention period.
    Cleanup(OutputArgs),

    /// Show the running task and the queue.
    Status(StatusArgs),

    /// Show one task.
    Show(ShowArgs),
}

/// Arguments for `packamal-scheduler enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Package ecosystem (npm, pypi, rubygems, packagist, crates.io, maven).
    pub ecosystem: String,

    /// Package name.
    pub package: String,

    /// Package version (defaults to the latest release).
    #[arg(short = 'v', long)]
    pub version: Option<String>,

    /// Analysis mode (dynamic or static).
    #[arg(short, long, default_value = "dynamic")]
    pub mode: String,

    /// Analyse a local archive instead of fetching from the registry.
    #[arg(long)]
    pub local: Option<String>,

    /// Higher priority runs first.
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Per-task timeout in minutes.
    #[arg(short, long)]
    pub timeout: Option<u32>,

    /// Retries allowed after a failure.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Output result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `packamal-scheduler serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Number of workers pulling dispatch jobs.
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Output options shared by the maintenance commands.
#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `packamal-scheduler status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Also list recent tasks with this status (queued, running, completed, failed).
    #[arg(short, long)]
    pub status: Option<String>,

    /// Maximum number of recent tasks to list.
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIST_LIMIT)]
    pub limit: u32,

    /// Output result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `packamal-scheduler show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Task id.
    pub task_id: Uuid,
}

/// JSON output of `enqueue`.
#[derive(Debug, Serialize)]
struct EnqueueOutput {
    task_id: Uuid,
    purl: Option<String>,
    queue_position: Option<u32>,
}

/// JSON output of `sweep-timeouts`.
#[derive(Debug, Serialize)]
struct SweepOutput {
    checked: usize,
    timed_out: Vec<Uuid>,
    stale_heartbeats: Vec<Uuid>,
    dispatched: Option<Uuid>,
}

/// JSON output of `cleanup`.
#[derive(Debug, Serialize)]
struct CleanupOutput {
    deleted_completed: u64,
    deleted_failed: u64,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::SweepTimeouts(args) => run_sweep_command(&config, args).await,
        Commands::Cleanup(args) => run_cleanup_command(&config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Show(args) => run_show_command(&config, args).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    // clap already merged the env fallback into these two flags.
    SchedulerConfig::from_lookup(|key| match key {
        "DATABASE_URL" => cli.database_url.clone(),
        "REDIS_URL" => cli.redis_url.clone(),
        other => std::env::var(other).ok(),
    })
    .context("Invalid scheduler configuration")
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_migrate_command(config: &SchedulerConfig) -> anyhow::Result<()> {
    let store = storage::connect(&config.database_url)
        .await
        .context("Failed to open task store")?;
    store.migrate().await.context("Migration failed")?;
    info!("Task store schema is up to date");
    println!("Migrations applied");
    Ok(())
}

async fn run_enqueue_command(config: &SchedulerConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let ecosystem: Ecosystem = args.ecosystem.parse()?;
    let mode: AnalysisMode = args.mode.parse()?;

    let mut request = AnalysisRequest::new(ecosystem, args.package).with_mode(mode);
    if let Some(version) = args.version {
        request = request.with_version(version);
    }
    if let Some(path) = args.local {
        request = request.with_local_artifact(path);
    }

    let scheduler = Scheduler::from_config(config).await?;

    let mut options: TaskOptions = scheduler.task_defaults();
    if let Some(priority) = args.priority {
        options = options.with_priority(priority);
    }
    if let Some(timeout) = args.timeout {
        options = options.with_timeout_minutes(timeout);
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }

    let task_id = scheduler.enqueue(request, Some(options)).await?;
    let task = scheduler.get(task_id).await?;

    if config.redis_url.is_none() {
        warn!("No shared dispatch queue; a running `serve` picks the task up on its next sweep");
    }

    if args.json {
        let output = EnqueueOutput {
            task_id,
            purl: task.purl.clone(),
            queue_position: task.queue_position,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queued {}", task_id);
    if let Some(purl) = &task.purl {
        println!("  purl:     {}", purl);
    }
    if let Some(position) = task.queue_position {
        println!("  position: {}", position);
    }
    Ok(())
}

async fn run_serve_command(mut config: SchedulerConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    config.validate().context("Invalid scheduler configuration")?;

    let scheduler = Scheduler::from_config(&config).await?;
    let mut pool = scheduler.worker_pool();
    pool.start().await?;

    info!(workers = pool.num_workers(), "Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        tasks_completed = stats.tasks_completed(),
        failed_runs = stats.failed_runs,
        job_errors = stats.job_errors,
        tasks_timed_out = stats.tasks_timed_out,
        tasks_purged = stats.tasks_purged,
        "Scheduler stopped"
    );
    Ok(())
}

async fn run_sweep_command(config: &SchedulerConfig, args: OutputArgs) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config).await?;
    let report = scheduler.sweep_timeouts().await?;

    if args.json {
        let output = SweepOutput {
            checked: report.checked,
            timed_out: report.timed_out,
            stale_heartbeats: report.stale_heartbeats,
            dispatched: report.dispatched,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "Checked {} running task(s), timed out {}",
        report.checked,
        report.timed_out.len()
    );
    for id in &report.timed_out {
        println!("  timed out: {}", id);
    }
    for id in &report.stale_heartbeats {
        println!("  stale heartbeat: {}", id);
    }
    if let Some(id) = report.dispatched {
        println!("Dispatched {}", id);
    }
    Ok(())
}

async fn run_cleanup_command(config: &SchedulerConfig, args: OutputArgs) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config).await?;
    let report = scheduler.cleanup_old_tasks().await?;

    if args.json {
        let output = CleanupOutput {
            deleted_completed: report.deleted_completed,
            deleted_failed: report.deleted_failed,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "Deleted {} completed and {} failed task(s)",
        report.deleted_completed, report.deleted_failed
    );
    Ok(())
}

async fn run_status_command(config: &SchedulerConfig, args: StatusArgs) -> anyhow::Result<()> {
    let status: Option<TaskStatus> = args
        .status
        .as_deref()
        .map(|s| s.parse::<TaskStatus>())
        .transpose()?;

    let scheduler = Scheduler::from_config(config).await?;
    let snapshot = scheduler.queue_snapshot().await?;
    let recent = match status {
        Some(status) => scheduler.list(Some(status), args.limit).await?,
        None => Vec::new(),
    };

    if args.json {
        let output = serde_json::json!({
            "running": snapshot.running,
            "queued": snapshot.queued,
            "pending_jobs": snapshot.pending_jobs,
            "recent": recent,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match &snapshot.running {
        Some(task) => println!("Running: {}", describe(task)),
        None => println!("Running: -"),
    }

    println!("Queued ({}):", snapshot.queued.len());
    for task in &snapshot.queued {
        println!(
            "  {:>3}. {}  priority={}",
            task.queue_position.unwrap_or_default(),
            describe(task),
            task.priority
        );
    }
    println!("Pending dispatch jobs: {}", snapshot.pending_jobs);

    if let Some(status) = status {
        println!("Recent {} ({}):", status, recent.len());
        for task in &recent {
            println!("  {}", describe(task));
        }
    }
    Ok(())
}

async fn run_show_command(config: &SchedulerConfig, args: ShowArgs) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config).await?;
    let task = scheduler.get(args.task_id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

fn describe(task: &AnalysisTask) -> String {
    format!(
        "{} {}/{}@{} [{}]",
        task.id,
        task.ecosystem,
        task.package_name,
        task.package_version.as_deref().unwrap_or("latest"),
        task.status
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "packamal-scheduler",
            "--database-url",
            "sqlite://tasks.db",
            "enqueue",
            "pypi",
            "requests",
            "--version",
            "2.31.0",
            "--priority",
            "10",
            "--timeout",
            "45",
        ])
        .unwrap();

        assert_eq!(cli.database_url.as_deref(), Some("sqlite://tasks.db"));
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.ecosystem, "pypi");
                assert_eq!(args.package, "requests");
                assert_eq!(args.version.as_deref(), Some("2.31.0"));
                assert_eq!(args.priority, Some(10));
                assert_eq!(args.timeout, Some(45));
                assert_eq!(args.mode, "dynamic");
                assert!(args.local.is_none());
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_parse_show_requires_uuid() {
        assert!(Cli::try_parse_from(["packamal-scheduler", "show", "not-a-uuid"]).is_err());
        let id = Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["packamal-scheduler", "show", id.as_str()]).is_ok());
    }
}
