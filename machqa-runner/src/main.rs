//! machqa — unattended quality verification for slot-machine web front-ends
//!
//! Startup sequence:
//! 1. Parse CLI arguments and load the TOML runner configuration
//! 2. Load and validate machine profiles (bad configuration stops the run
//!    before any browser starts)
//! 3. Build the shared queue, control handle and event bus
//! 4. Spawn the control-input tasks (Ctrl+C → stop; stdin commands) and an
//!    event logger
//! 5. Spawn one worker per configured slot, each with its own browser
//! 6. Join workers, log the final summary

use anyhow::{bail, Context, Result};
use clap::Parser;
use machqa_common::events::{EventBus, QaEvent};
use machqa_common::profile::ProfileSet;
use machqa_common::report::SessionReport;
use machqa_runner::config::RunnerConfig;
use machqa_runner::control::ControlHandle;
use machqa_runner::driver::ChromeDriver;
use machqa_runner::notify::WebhookClient;
use machqa_runner::queue::TaskQueue;
use machqa_runner::worker::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "machqa",
    version,
    about = "Unattended verification of slot-machine web front-ends"
)]
struct Args {
    /// Path to the runner configuration file
    #[arg(short, long, default_value = "machqa.toml")]
    config: PathBuf,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Override the configured targets file
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Run the browsers headless (or headed with --headless=false)
    #[arg(long)]
    headless: Option<bool>,

    /// Webhook URL for session reports
    #[arg(long, env = "MACHQA_WEBHOOK_URL")]
    webhook_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("machqa {} starting", env!("CARGO_PKG_VERSION"));

    let mut config = RunnerConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(targets) = args.targets {
        config.targets_file = targets;
    }
    if let Some(headless) = args.headless {
        config.browser.headless = headless;
    }
    if args.webhook_url.is_some() {
        config.webhook_url = args.webhook_url;
    }
    config.validate().context("validating configuration")?;

    let profiles =
        Arc::new(ProfileSet::load(&config.profiles_dir).context("loading machine profiles")?);
    if profiles.is_empty() {
        bail!(
            "no machine profiles found under {}",
            config.profiles_dir.display()
        );
    }
    info!(profiles = ?profiles.names(), "Machine profiles ready");

    let targets = config.load_targets().context("loading target codes")?;
    if targets.is_empty() {
        bail!(
            "no target codes in {}",
            config.targets_file.display()
        );
    }

    let queue = Arc::new(TaskQueue::new(targets));
    let control = ControlHandle::new();
    let events = EventBus::new(256);
    let notifier = Arc::new(WebhookClient::new(config.webhook_url.clone()));

    spawn_event_logger(&events);
    spawn_control_input(control.clone());

    let (_, total) = queue.progress();
    events.emit_lossy(QaEvent::RunStarted {
        total_targets: total,
        workers: config.workers,
        timestamp: chrono::Utc::now(),
    });

    let mut handles = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        let worker = Worker::new(
            format!("worker-{}", index + 1),
            Arc::clone(&queue),
            Arc::clone(&profiles),
            control.clone(),
            events.clone(),
            Some(Arc::clone(&notifier)),
        );
        let browser_settings = config.browser.clone();

        handles.push(tokio::spawn(async move {
            let driver = match ChromeDriver::launch(&browser_settings).await {
                Ok(driver) => driver,
                Err(e) => {
                    error!(worker = %worker.id(), error = %e, "Browser launch failed");
                    return Vec::new();
                }
            };
            let reports = worker.run(&driver).await;
            driver.close().await;
            reports
        }));

        // stagger startups so the browsers do not all race for resources
        if index + 1 < config.workers {
            tokio::time::sleep(Duration::from_secs_f64(config.worker_stagger_secs)).await;
        }
    }

    let mut reports: Vec<SessionReport> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(worker_reports) => reports.extend(worker_reports),
            Err(e) => error!("Worker task failed: {e}"),
        }
    }

    let completed = reports.iter().filter(|r| r.completed()).count();
    let aborted = reports.len() - completed;
    events.emit_lossy(QaEvent::RunCompleted {
        completed,
        aborted,
        timestamp: chrono::Utc::now(),
    });

    let (taken, total) = queue.progress();
    info!(
        sessions = reports.len(),
        completed,
        aborted,
        progress = %format!("{taken}/{total}"),
        "Run finished"
    );
    for (worker, codes) in queue.worker_history() {
        info!(worker = %worker, targets = codes.len(), codes = ?codes, "Worker history");
    }

    Ok(())
}

/// Log every broadcast event; also keeps the bus from running unsubscribed
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "machqa::events", "{json}"),
                    Err(e) => warn!("Event serialization failed: {e}"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event logger lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// External control triggers: Ctrl+C stops; stdin accepts pause/resume/stop
fn spawn_control_input(control: ControlHandle) {
    let ctrl_c_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received");
            ctrl_c_control.request_stop();
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("Control commands on stdin: pause | resume | stop");
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim().to_lowercase().as_str() {
                "pause" | "p" => control.request_pause(),
                "resume" | "r" => control.request_resume(),
                "stop" | "q" => {
                    control.request_stop();
                    break;
                }
                "" => {}
                other => warn!("Unknown control command: {other}"),
            }
        }
    });
}
