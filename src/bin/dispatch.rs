//! dispatch CLI: run self-feeding workloads on the worker pool.

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use dispatch_rs::config::Config;
use dispatch_rs::dispatcher::{Dispatcher, LifecycleEvent, RunSummary, WorkerState};
use dispatch_rs::telemetry::init_telemetry;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dispatch", about = "Run self-feeding workloads on a worker pool")]
struct Cli {
    /// TOML config file (environment variables are used when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Number of worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Items a worker takes per dequeue
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Cancel remaining items after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count from 1 to LIMIT, each item enqueueing its successor
    Count {
        #[arg(long, default_value_t = 1000)]
        limit: u64,
    },
    /// Walk a directory tree, one item per directory
    Walk {
        /// Directory to start from
        root: PathBuf,
        /// Fail the run on unreadable directories instead of skipping them
        #[arg(long)]
        strict: bool,
    },
}

/// Per-worker tally for `walk`, merged into the totals when the worker stops.
#[derive(Debug, Default, Clone, Copy, Serialize)]
struct WalkTally {
    dirs: u64,
    files: u64,
    bytes: u64,
}

impl WalkTally {
    fn merge(&mut self, other: &WalkTally) {
        self.dirs += other.dirs;
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;

    let _guard = init_telemetry(config.telemetry("dispatch"))?;
    let timeout = cli.timeout_secs.map(Duration::from_secs);

    match cli.command {
        Command::Count { limit } => cmd_count(&config, limit, timeout, cli.json).await,
        Command::Walk { root, strict } => cmd_walk(&config, root, strict, timeout, cli.json).await,
    }
}

async fn cmd_count(
    config: &Config,
    limit: u64,
    timeout: Option<Duration>,
    json: bool,
) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::clone(&cancel);

    let dispatcher = Dispatcher::<u64>::with_options(
        move |d, _worker, value, _state| {
            if cancelled.load(Ordering::Relaxed) {
                bail!("cancelled before processing {value}");
            }
            if *value < limit {
                d.push(value + 1);
            }
            Ok(())
        },
        config.dispatcher_options(),
    )?;
    dispatcher.push(1);

    let summary = run_to_completion(&dispatcher, config.workers, &cancel, timeout).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    ensure_succeeded(&summary, &cancel)
}

async fn cmd_walk(
    config: &Config,
    root: PathBuf,
    strict: bool,
    timeout: Option<Duration>,
    json: bool,
) -> anyhow::Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::clone(&cancel);
    let totals = Arc::new(Mutex::new(WalkTally::default()));

    let dispatcher = Dispatcher::<PathBuf>::with_options(
        move |d, _worker, dir, state| {
            if cancelled.load(Ordering::Relaxed) {
                bail!("cancelled before reading {}", dir.display());
            }
            let tally = state
                .get_mut::<WalkTally>()
                .ok_or_else(|| anyhow!("worker tally missing"))?;
            tally.dirs += 1;

            let mut subdirs = Vec::new();
            let entries =
                std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
            for entry in entries {
                let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    subdirs.push(entry.path());
                } else if file_type.is_file() {
                    tally.files += 1;
                    tally.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            d.enqueue(subdirs);
            Ok(())
        },
        config.dispatcher_options(),
    )?;

    let merged = Arc::clone(&totals);
    dispatcher.set_lifecycle_handler(move |_, _worker, event, mut prior| match event {
        LifecycleEvent::Started => Ok(WorkerState::new(WalkTally::default())),
        LifecycleEvent::Stopped => {
            if let Some(tally) = prior.take::<WalkTally>() {
                merged
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge(&tally);
            }
            Ok(WorkerState::empty())
        }
    });
    dispatcher.set_error_handler(move |_, worker, dir, err, _| {
        warn!(worker, dir = %dir.display(), error = %format!("{err:#}"), "skipping directory");
        !strict
    });

    dispatcher.push(root);
    let summary = run_to_completion(&dispatcher, config.workers, &cancel, timeout).await?;
    let totals = *totals.lock().unwrap_or_else(PoisonError::into_inner);

    if json {
        let report = serde_json::json!({ "summary": summary, "totals": totals });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&summary);
        println!("Dirs:       {}", totals.dirs);
        println!("Files:      {}", totals.files);
        println!("Bytes:      {}", totals.bytes);
    }
    ensure_succeeded(&summary, &cancel)
}

/// Start the pool and wait on a blocking thread. Ctrl-C or the timeout sets
/// `cancel`, which the consumers observe to fail the remaining items fast.
async fn run_to_completion<T>(
    dispatcher: &Dispatcher<T>,
    workers: usize,
    cancel: &AtomicBool,
    timeout: Option<Duration>,
) -> anyhow::Result<RunSummary>
where
    T: std::fmt::Debug + Send + 'static,
{
    dispatcher.start(workers)?;
    info!(workers, "waiting for completion");

    let waiter = dispatcher.clone();
    let mut wait = tokio::task::spawn_blocking(move || waiter.wait_for_completion());
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        summary = &mut wait => {
            return summary?.ok_or_else(|| anyhow!("dispatcher was not running"));
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling remaining items");
        }
        _ = deadline => {
            warn!("timeout reached, cancelling remaining items");
        }
    }

    cancel.store(true, Ordering::Relaxed);
    wait.await?
        .ok_or_else(|| anyhow!("dispatcher was not running"))
}

fn print_summary(summary: &RunSummary) {
    println!("Run:        {}", summary.run_id);
    println!("Workers:    {}", summary.workers);
    println!("Processed:  {}", summary.processed);
    println!("Failed:     {}", summary.failed);
    println!("Elapsed:    {}ms", summary.elapsed().num_milliseconds());
    println!(
        "Result:     {}",
        if summary.succeeded { "success" } else { "failure" }
    );
}

fn ensure_succeeded(summary: &RunSummary, cancel: &AtomicBool) -> anyhow::Result<()> {
    if cancel.load(Ordering::Relaxed) {
        bail!("run cancelled after {} item(s)", summary.processed);
    }
    if !summary.succeeded {
        bail!("{} item(s) were not recovered", summary.unrecovered);
    }
    Ok(())
}
