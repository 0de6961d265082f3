//! Backup job executor - Orchestrates one backup run.
//!
//! A run takes a new snapshot (optional), brings every target up to date and
//! finally applies retention on the source and on each target it reached.
//! Targets are independent: a target that cannot be reached or fails halfway
//! is reported and the remaining targets still run.

use crate::config::{Config, JobConfig};
use crate::endpoint::{build_endpoint, Endpoint, EndpointSettings, LocalEndpoint, LocalSource};
use crate::locks::select_for_deletion;
use crate::planner::{Planner, SyncReport};
use crate::transfer::TransferEngine;
use crate::utils::errors::{AgentError, Result};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backup job configuration
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub name: String,
    pub subvolume: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub take_snapshot: bool,
    pub keep_snapshots: usize,
    pub keep_backups: usize,
    pub no_incremental: bool,
    pub targets: Vec<String>,
    pub settings: EndpointSettings,
}

impl BackupJob {
    pub fn from_config(config: &Config, job: &JobConfig) -> Self {
        Self {
            name: job.name.clone(),
            subvolume: job.source.clone(),
            snapshot_dir: job.snapshot_dir.clone(),
            take_snapshot: job.take_snapshot,
            keep_snapshots: job.keep_snapshots,
            keep_backups: job.keep_backups,
            no_incremental: config.transfer.no_incremental,
            targets: job.targets.clone(),
            settings: config.endpoint_settings(&job.prefix),
        }
    }

    /// The job's local snapshot directory.
    pub fn source_endpoint(&self) -> LocalEndpoint {
        LocalEndpoint::new(&self.snapshot_dir, &self.settings.prefix)
            .with_btrfs_command(&self.settings.btrfs_command)
            .with_command_timeout(self.settings.command_timeout)
    }
}

/// Outcome for one target
#[derive(Debug)]
pub struct TargetResult {
    pub target: String,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
    /// Snapshots removed from the target by retention
    pub deleted: Vec<String>,
}

impl TargetResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.report.as_ref().map(|r| r.is_clean()).unwrap_or(false)
    }
}

/// Backup execution result
#[derive(Debug)]
pub struct BackupResult {
    pub job: String,
    pub snapshot: Option<String>,
    pub targets: Vec<TargetResult>,
    /// Snapshots removed from the source by retention
    pub deleted: Vec<String>,
    pub duration_secs: u64,
}

impl BackupResult {
    pub fn succeeded(&self) -> bool {
        self.targets.iter().all(|t| t.succeeded())
    }
}

/// Main backup executor
pub struct BackupExecutor {
    engine: TransferEngine,
    cancel_token: CancellationToken,
}

impl BackupExecutor {
    /// Create a new backup executor (no cancellation support)
    pub fn new(engine: TransferEngine) -> Self {
        Self {
            engine,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create a new backup executor with cancellation support
    pub fn with_cancel(engine: TransferEngine, cancel_token: CancellationToken) -> Self {
        Self { engine, cancel_token }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Execute a backup job
    pub async fn execute(&self, job: &BackupJob) -> Result<BackupResult> {
        let start_time = Instant::now();
        info!(job = %job.name, targets = job.targets.len(), "Starting backup job");

        let mut source = job.source_endpoint();
        let mut snapshot = None;
        if job.take_snapshot {
            let subvolume = job.subvolume.clone().ok_or_else(|| {
                AgentError::Abort(format!("job '{}' has no source subvolume to snapshot", job.name))
            })?;
            let local = LocalSource::new(subvolume, source);
            snapshot = Some(local.create_snapshot().await?.name());
            source = local.into_endpoint();
        }

        let mut targets = Vec::with_capacity(job.targets.len());
        for url in &job.targets {
            if self.cancel_token.is_cancelled() {
                warn!(job = %job.name, "Backup cancelled, skipping remaining targets");
                break;
            }
            targets.push(self.sync_target(job, &source, url).await);
        }

        let deleted = if self.cancel_token.is_cancelled() {
            Vec::new()
        } else {
            apply_retention(&source, job.keep_snapshots).await?
        };

        let result = BackupResult {
            job: job.name.clone(),
            snapshot,
            targets,
            deleted,
            duration_secs: start_time.elapsed().as_secs(),
        };
        info!(
            job = %job.name,
            succeeded = result.succeeded(),
            "Backup job finished in {}s",
            result.duration_secs
        );
        Ok(result)
    }

    async fn sync_target(&self, job: &BackupJob, source: &LocalEndpoint, url: &str) -> TargetResult {
        let mut result = TargetResult {
            target: url.to_string(),
            report: None,
            error: None,
            deleted: Vec::new(),
        };

        let destination = match build_endpoint(url, &job.settings) {
            Ok(destination) => destination,
            Err(e) => {
                error!(job = %job.name, url = %url, "Invalid target: {}", e);
                result.error = Some(e.to_string());
                return result;
            }
        };

        let planner = Planner::new(&self.engine)
            .no_incremental(job.no_incremental)
            .keep(job.keep_backups)
            .with_cancel(self.cancel_token.clone());

        match planner.sync(source, destination.as_ref()).await {
            Ok(report) => result.report = Some(report),
            Err(e) => {
                error!(job = %job.name, url = %url, "Target aborted: {}", e);
                result.error = Some(e.to_string());
                return result;
            }
        }

        match apply_retention(destination.as_ref(), job.keep_backups).await {
            Ok(deleted) => result.deleted = deleted,
            Err(e) => warn!(job = %job.name, url = %url, "Retention failed: {}", e),
        }
        result
    }
}

/// Delete old unlocked snapshots, keeping the newest `keep` unlocked ones.
pub async fn apply_retention(endpoint: &dyn Endpoint, keep: usize) -> Result<Vec<String>> {
    if keep == 0 {
        return Ok(Vec::new());
    }
    let snapshots = endpoint.list_snapshots(true).await?;
    let table = endpoint.lock_table().await?;
    let doomed = select_for_deletion(&snapshots, &table, keep);
    if doomed.is_empty() {
        return Ok(Vec::new());
    }

    info!(endpoint = %endpoint.id(), count = doomed.len(), "Applying retention");
    let deleted = endpoint.delete_snapshots(&doomed).await?;
    Ok(deleted.iter().map(|s| s.name()).collect())
}

/// Release every lock held by `lock_id` on `endpoint`.
pub async fn unlock(endpoint: &dyn Endpoint, lock_id: &str) -> Result<Vec<String>> {
    let released = endpoint.clear_locks(lock_id).await?;
    if released.is_empty() {
        info!(endpoint = %endpoint.id(), lock_id = %lock_id, "No locks held");
    } else {
        info!(endpoint = %endpoint.id(), lock_id = %lock_id, "Released locks on {}", released.join(", "));
    }
    Ok(released)
}
