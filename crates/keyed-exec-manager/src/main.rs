use anyhow::Context;
use clap::Parser;
use keyed_exec_manager::{Action, Manager, ManagerConfig, StateSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kx-demo")]
#[command(about = "Runs synthetic work through a keyed executor", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Number of distinct keys (simulated devices)
    #[arg(short, long, default_value = "3")]
    keys: usize,

    /// Items submitted per key
    #[arg(short, long, default_value = "4")]
    items: usize,

    /// Invocations per item
    #[arg(short, long, default_value = "2")]
    repeat: u32,

    /// Pause after each invocation, in milliseconds
    #[arg(long, default_value = "50")]
    delay_ms: u64,

    /// Simulated work per invocation, in milliseconds
    #[arg(long, default_value = "100")]
    work_ms: u64,

    /// Every n-th item fails (0 disables failures)
    #[arg(long, default_value = "3")]
    fail_every: usize,

    /// Per-key queue bound (overrides the config file)
    #[arg(long)]
    max_queue_size: Option<usize>,

    /// Give up and terminate keys still running after this many seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Clone)]
struct DemoJob {
    index: usize,
    work: Duration,
    fail: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) if std::path::Path::new(path).exists() => ManagerConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file {} not found, using defaults", path);
            ManagerConfig::default()
        }
        None => ManagerConfig::default(),
    };

    // Override with CLI args
    if let Some(max_queue_size) = args.max_queue_size {
        config.max_queue_size = max_queue_size;
    }

    let manager = Arc::new(Manager::<DemoJob>::new(config)?);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let keys: Vec<String> = (0..args.keys).map(|k| format!("device-{}", k)).collect();

    let mut submitter = {
        let manager = manager.clone();
        let keys = keys.clone();
        let args_items = args.items;
        let repeat = args.repeat;
        let delay = Duration::from_millis(args.delay_ms);
        let work = Duration::from_millis(args.work_ms);
        let fail_every = args.fail_every;

        tokio::spawn(async move {
            for index in 0..args_items {
                for key in &keys {
                    let job = DemoJob {
                        index,
                        work,
                        fail: fail_every > 0 && (index + 1) % fail_every == 0,
                    };
                    submit_with_backoff(&manager, key, repeat, delay, job, deadline).await?;
                }
            }
            anyhow::Ok(())
        })
    };

    tokio::select! {
        result = &mut submitter => {
            result.context("submitter task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            submitter.abort();
            let aborted = manager.terminate_all();
            tracing::warn!("Terminated keys: {:?}", aborted);
        }
    }

    // Wait for every key to finish, terminating stragglers at the deadline
    for key in &keys {
        let Some(state) = manager.execution_state(key) else {
            continue;
        };

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let finished = tokio::task::spawn_blocking(move || state.wait_finished(remaining)).await?;

        if !finished {
            tracing::warn!("Key {} still running at deadline, terminating", key);
            manager.terminate(key)?;
        }
    }

    let snapshots: Vec<StateSnapshot> = keys
        .iter()
        .filter_map(|key| manager.execution_state(key))
        .map(|state| state.snapshot())
        .collect();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);

    if args.metrics {
        println!("{}", manager.metrics().gather_text()?);
    }

    Ok(())
}

/// Submit one job, retrying while the key's queue is full
async fn submit_with_backoff(
    manager: &Manager<DemoJob>,
    key: &str,
    repeat: u32,
    delay: Duration,
    job: DemoJob,
    deadline: tokio::time::Instant,
) -> anyhow::Result<()> {
    loop {
        let action = Action::with_state(job.clone(), |job: &DemoJob, state| {
            state.set_checkpoint(1);
            std::thread::sleep(job.work);
            state.set_checkpoint(2);
            state.set_value("last_index", job.index);
            if job.fail {
                anyhow::bail!("job {} failed on purpose", job.index);
            }
            Ok(())
        });

        let submission = manager.submit_repeated(key, repeat, delay, action)?;
        if submission.is_accepted() {
            tracing::info!("Submitted job {} to {}", job.index, key);
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("gave up submitting job {} to {}", job.index, key);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
