//! Snapshot Agent - Main entry point
//!
//! Runs the configured backup jobs once, or performs a restore or unlock.

use anyhow::{bail, Context, Result};
use clap::Parser;
use snapshot_agent::config::Config;
use snapshot_agent::endpoint::{build_endpoint, build_send_endpoint};
use snapshot_agent::executor::{self, BackupExecutor, BackupJob};
use snapshot_agent::restore::{restore_snapshot, RestoreOptions};
use snapshot_agent::utils::{self, shutdown::ShutdownCoordinator};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Only run this job
    #[arg(short, long)]
    job: Option<String>,

    /// Release every lock held by this id on the job's source and targets
    #[arg(long, value_name = "LOCK_ID")]
    unlock: Option<String>,

    /// Restore this snapshot (needs --from and --to)
    #[arg(long, value_name = "SNAPSHOT", requires_all = ["from", "to"])]
    restore: Option<String>,

    /// Backup location to restore from
    #[arg(long, value_name = "URL")]
    from: Option<String>,

    /// Where the restored snapshots go
    #[arg(long, value_name = "URL")]
    to: Option<String>,

    /// Restore only the requested snapshot, not the chain leading to it
    #[arg(long)]
    latest_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting snapshot-agent v{}", env!("CARGO_PKG_VERSION"));

    let jobs: Vec<BackupJob> = config
        .jobs
        .iter()
        .filter(|j| args.job.as_deref().map_or(true, |name| j.name == name))
        .map(|j| BackupJob::from_config(&config, j))
        .collect();
    if let Some(name) = &args.job {
        if jobs.is_empty() {
            bail!("no job named '{}'", name);
        }
    }

    if let Some(snapshot) = &args.restore {
        return restore(&config, &jobs, &args, snapshot).await;
    }
    if let Some(lock_id) = &args.unlock {
        return unlock(&jobs, lock_id).await;
    }
    if jobs.is_empty() {
        bail!("no jobs configured");
    }

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.clone();
    let signal_task = tokio::spawn(async move { signals.wait_for_signal().await });

    let executor = BackupExecutor::with_cancel(config.transfer_engine(), shutdown.token());
    let mut failed = Vec::new();
    for job in &jobs {
        match executor.execute(job).await {
            Ok(result) if result.succeeded() => {}
            Ok(result) => {
                for target in result.targets.iter().filter(|t| !t.succeeded()) {
                    tracing::warn!(job = %job.name, url = %target.target, "Target did not complete");
                }
                failed.push(job.name.clone());
            }
            Err(e) => {
                tracing::error!(job = %job.name, "Backup job failed: {}", e);
                failed.push(job.name.clone());
            }
        }
    }

    shutdown.trigger();
    let _ = signal_task.await;

    if !failed.is_empty() {
        bail!("jobs with failures: {}", failed.join(", "));
    }
    Ok(())
}

async fn restore(config: &Config, jobs: &[BackupJob], args: &Args, snapshot: &str) -> Result<()> {
    let (Some(from), Some(to)) = (&args.from, &args.to) else {
        bail!("--restore needs --from and --to");
    };
    let prefix = jobs
        .iter()
        .find(|j| snapshot.starts_with(&j.settings.prefix))
        .map(|j| j.settings.prefix.clone())
        .context("snapshot name does not match the prefix of any configured job")?;

    let settings = config.endpoint_settings(&prefix);
    let backup = build_send_endpoint(from, &settings)?;
    let target = build_endpoint(to, &settings)?;
    let options = RestoreOptions {
        full_chain: !args.latest_only,
    };

    let report = restore_snapshot(&config.transfer_engine(), backup.as_ref(), target.as_ref(), snapshot, options).await?;
    tracing::info!("Restored {} snapshot(s): {}", report.restored.len(), report.restored.join(", "));
    Ok(())
}

async fn unlock(jobs: &[BackupJob], lock_id: &str) -> Result<()> {
    for job in jobs {
        executor::unlock(&job.source_endpoint(), lock_id).await?;
        for url in &job.targets {
            match build_endpoint(url, &job.settings) {
                Ok(endpoint) => {
                    if let Err(e) = executor::unlock(endpoint.as_ref(), lock_id).await {
                        tracing::warn!(url = %url, "Could not release locks: {}", e);
                    }
                }
                Err(e) => tracing::warn!(url = %url, "Invalid target: {}", e),
            }
        }
    }
    Ok(())
}
