//! FieldSync background sync agent
//!
//! Keeps a device's local store in sync with the remote service:
//! 1. Probes connectivity and drains the mutation queue when online
//! 2. Warms the local cache on startup, on TTL expiry, and periodically
//!
//! Usage:
//!   fieldsync-agent --config agent.json run
//!   fieldsync-agent --config agent.json queue --dead-letters

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldsync_agent::{Agent, AgentConfig};
use fieldsync_sync::{DrainOutcome, DrainTrigger, StepStatus};
use fieldsync_types::time::now_millis;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "fieldsync-agent")]
#[command(about = "FieldSync offline-first sync agent")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the data directory from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides the signed-in user id from the config file
    #[arg(long)]
    user_id: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the probe, drain, and warm loops until interrupted
    Run,
    /// Probe once and drain the queue
    Drain,
    /// Warm the local cache
    Warm {
        /// Warm even if the cache is still fresh
        #[arg(long)]
        force: bool,
    },
    /// Show pending queue items
    Queue {
        /// Also show discarded items
        #[arg(long)]
        dead_letters: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(user_id) = args.user_id {
        config.user_id = Some(user_id);
    }

    let agent = Agent::from_config(&config)?;

    match args.command {
        Command::Run => {
            info!("FieldSync agent starting (data dir {})", config.data_dir.display());
            agent
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for ctrl-c: {}", e);
                    }
                })
                .await?;
        }
        Command::Drain => {
            let state = agent.monitor.probe_now().await;
            info!("Connectivity: {}", state);
            let outcome = agent
                .processor
                .drain(DrainTrigger::Manual)
                .await
                .context("drain failed")?;
            match outcome {
                DrainOutcome::Completed(report) => {
                    println!(
                        "synced {}, failed {}, discarded {} (stale {}, exhausted {}), reconciled {}",
                        report.succeeded,
                        report.failed,
                        report.discarded(),
                        report.discarded_stale,
                        report.discarded_exhausted,
                        report.reconciled
                    );
                }
                DrainOutcome::Offline => println!("not online ({state}), queue left untouched"),
                DrainOutcome::AlreadyRunning => println!("a drain is already running"),
            }
        }
        Command::Warm { force } => {
            let summary = if force {
                Some(
                    agent
                        .warmer
                        .full_sync(|p| {
                            if p.status != StepStatus::Loading {
                                println!("  {:<14} {:?}", p.step_id, p.status);
                            }
                        })
                        .await?,
                )
            } else {
                agent.warmer.warm_if_stale().await?
            };
            match summary {
                Some(summary) => println!(
                    "warmed {}/{} steps, {} records, failed: {:?}",
                    summary.refreshed(),
                    summary.steps.len(),
                    summary.total_records(),
                    summary.failed_steps()
                ),
                None => println!("cache is fresh"),
            }
        }
        Command::Queue { dead_letters } => {
            let now = now_millis();
            let items = agent.store.queue_items().await?;
            println!("{} queued", items.len());
            for item in &items {
                println!(
                    "  #{:<5} {:<14} age {:>6}s  retries {}  {}",
                    item.id,
                    item.action,
                    item.age(now).as_secs(),
                    item.retry_count,
                    item.last_error.as_deref().unwrap_or("")
                );
            }
            if dead_letters {
                let dead = agent.store.dead_letters().await?;
                println!("{} discarded", dead.len());
                for letter in &dead {
                    println!(
                        "  #{:<5} {:<14} {:<18} {}",
                        letter.item.id,
                        letter.item.action,
                        letter.reason.as_str(),
                        letter.item.last_error.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}
