//! mangaqueue - offline download queue for manga chapters and anime episodes
//!
//! Command-line front end over the persistent queue. Every subcommand opens
//! the same SQLite store. `run` holds a lease on it while downloading: tasks
//! from `add` are adopted by the running process within a second, and the
//! other changing subcommands are refused until it exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mangaqueue::queue::task::ContentKind;
use mangaqueue::utils::{get_config_path, QueueSettings};
use mangaqueue::{DownloadTask, NewTask, QueueManager, StatusSet, TaskStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mangaqueue", version, about)]
struct Args {
    /// Settings file (JSON); defaults to the platform data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue chapters or episodes of one title
    Add {
        /// Content kind: manga or anime
        #[arg(long, default_value = "manga")]
        kind: ContentKind,
        /// Id of the manga or anime at its source
        content_id: String,
        /// Chapter or episode ids, in download order
        #[arg(required = true)]
        units: Vec<String>,
        #[arg(long)]
        title: Option<String>,
        /// Higher is admitted first
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },
    /// List tasks
    List {
        /// Only tasks with this status (queued, in_progress, paused, ...)
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    Pause { id: String },
    Resume { id: String },
    Cancel { id: String },
    /// Requeue a failed task with a fresh retry budget
    Retry { id: String },
    /// Delete a finished, failed or cancelled task
    Remove { id: String },
    /// Delete every completed task
    ClearCompleted,
    /// Download until the queue drains or Ctrl-C
    Run {
        /// Bandwidth cap in bytes per second
        #[arg(long)]
        limit: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = args.config.unwrap_or_else(get_config_path);
    let settings = QueueSettings::load(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(execute(args.command, settings))
}

async fn execute(command: Command, settings: QueueSettings) -> Result<()> {
    let manager = QueueManager::open(settings).await?;

    if matches!(
        command,
        Command::Pause { .. }
            | Command::Resume { .. }
            | Command::Cancel { .. }
            | Command::Retry { .. }
            | Command::Remove { .. }
            | Command::ClearCompleted
    ) {
        manager.ensure_not_running_elsewhere().await?;
    }

    match command {
        Command::Add {
            kind,
            content_id,
            units,
            title,
            priority,
        } => {
            let mut request = NewTask::new(content_id, kind, units).priority(priority);
            if let Some(title) = title {
                request = request.title(title);
            }
            let id = manager.enqueue(request).await?;
            println!("{}", id);
        }
        Command::List { status } => {
            let filter = status.map(StatusSet::from).unwrap_or(StatusSet::ALL);
            for task in manager.list(filter).await {
                print_task(&task);
            }
        }
        Command::Pause { id } => print_task(&manager.pause(&id).await?),
        Command::Resume { id } => print_task(&manager.resume(&id).await?),
        Command::Cancel { id } => print_task(&manager.cancel(&id).await?),
        Command::Retry { id } => print_task(&manager.retry(&id).await?),
        Command::Remove { id } => {
            manager.remove(&id).await?;
            println!("removed {}", id);
        }
        Command::ClearCompleted => {
            let removed = manager.clear_completed().await?;
            println!("removed {} completed tasks", removed.len());
        }
        Command::Run { limit } => run(manager, limit).await?,
    }

    Ok(())
}

async fn run(manager: QueueManager, limit: Option<u64>) -> Result<()> {
    manager.acquire_lease().await?;
    if limit.is_some() {
        manager.set_bandwidth_limit(limit).await;
    }
    manager.start().await?;

    let mut updates = manager.subscribe_progress();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted, stopping workers");
                break;
            }
            update = updates.recv() => {
                if let Ok(update) = update {
                    let task = &update.task;
                    let overall = update
                        .overall
                        .fraction()
                        .map(|f| format!("{:.1}%", f * 100.0))
                        .unwrap_or_else(|| "--".to_string());
                    let fraction = task
                        .fraction()
                        .map(|f| format!("{:.1}%", f * 100.0))
                        .unwrap_or_else(|| "--".to_string());
                    println!(
                        "{} {:<11} {:>6} {}/{} units {:.0} KB/s  [overall {}]",
                        task.task_id,
                        task.status,
                        fraction,
                        task.units_completed,
                        task.units_total,
                        task.speed / 1024.0,
                        overall
                    );
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = manager.renew_lease().await {
                    eprintln!("lost the queue lease: {}", e);
                    break;
                }
                if let Err(e) = manager.adopt_new_tasks().await {
                    eprintln!("failed to load new tasks: {}", e);
                }
                if manager.is_drained().await {
                    println!("queue drained");
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    manager.release_lease().await?;
    Ok(())
}

fn print_task(task: &DownloadTask) {
    let total = task
        .bytes_total
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{}  {:<11} p{:<3} {:<24} {}/{} units  {}/{} bytes  retries {}{}",
        task.id,
        task.status,
        task.priority,
        task.title,
        task.checkpoint.units_completed,
        task.units.len(),
        task.bytes_downloaded,
        total,
        task.retry_count,
        task.last_error
            .as_deref()
            .map(|e| format!("  error: {}", e))
            .unwrap_or_default()
    );
}
