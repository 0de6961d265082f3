//! Moving one snapshot from a send endpoint to a destination.
//!
//! [`TransferEngine::transfer`] prepares the destination, optionally checks
//! free space, then either runs a process [`pipeline`] or hands the job to the
//! resumable [`chunked`] engine. Every attempt is written to the transaction
//! log as started, then completed or failed.

pub mod chunked;
pub mod filters;
pub mod pipeline;
pub mod progress;
pub mod progress_stream;
pub mod transaction_log;

use crate::endpoint::{Endpoint, ReceiveOptions, SendEndpoint};
use crate::snapshot::Snapshot;
use crate::utils::errors::{AgentError, Result, SnapshotTransferError};
use chunked::ChunkedTransferEngine;
use filters::{rate_limit_argv, Compression};
use pipeline::{FilterSpec, Pipeline};
use progress::{format_bytes, Heartbeat, ProgressMode, ProgressReporter, LOG_INTERVAL};
use std::fmt;
use std::time::{Duration, Instant};
use transaction_log::{TransactionLog, TransactionRecord, TransactionStatus};
use tracing::{debug, info, warn};

/// Upper bounds on how long each kind of stage may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub send: Duration,
    pub filter: Duration,
    /// Counted from the moment upstream has finished.
    pub receive: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            send: Duration::from_secs(3600),
            filter: Duration::from_secs(3600),
            receive: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    /// OS pipes end to end; the destination reads the local send output itself.
    DirectPipe,
    /// Local pipes with an in-process pump in front of `receive`.
    Filtered,
    /// Checksummed chunks through the resumable engine.
    Chunked,
}

impl fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportStrategy::DirectPipe => "direct-pipe",
            TransportStrategy::Filtered => "filtered",
            TransportStrategy::Chunked => "chunked",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub compression: Option<Compression>,
    /// `pv` rate, e.g. `20M`.
    pub rate_limit: Option<String>,
    pub progress: bool,
    pub check_space: bool,
    /// Extra space required on top of the estimate, in percent.
    pub space_margin_percent: u64,
    /// Transfer even when the space check fails.
    pub force: bool,
    pub timeouts: StageTimeouts,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            compression: None,
            rate_limit: None,
            progress: true,
            check_space: true,
            space_margin_percent: 10,
            force: false,
            timeouts: StageTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferOutcome {
    /// Stream size, when it was measured.
    pub bytes: Option<u64>,
    pub duration: Duration,
    pub strategy: TransportStrategy,
}

/// Estimate plus the configured safety margin.
pub fn required_space(estimate: u64, margin_percent: u64) -> u64 {
    estimate.saturating_add(estimate.saturating_mul(margin_percent) / 100)
}

pub struct TransferEngine {
    options: TransferOptions,
    log: TransactionLog,
    chunked: Option<ChunkedTransferEngine>,
}

impl TransferEngine {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options,
            log: TransactionLog::disabled(),
            chunked: None,
        }
    }

    pub fn with_transaction_log(mut self, log: TransactionLog) -> Self {
        self.log = log;
        self
    }

    /// Send every snapshot through the resumable chunked engine.
    pub fn with_chunked(mut self, engine: ChunkedTransferEngine) -> Self {
        self.chunked = Some(engine);
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn chunked(&self) -> Option<&ChunkedTransferEngine> {
        self.chunked.as_ref()
    }

    pub fn strategy_for(&self, destination: &dyn Endpoint) -> TransportStrategy {
        if self.chunked.is_some() {
            TransportStrategy::Chunked
        } else if destination.is_remote() && destination.supports_direct_pipe() {
            TransportStrategy::DirectPipe
        } else {
            TransportStrategy::Filtered
        }
    }

    /// Transfer `snapshot` from `source` to `destination`, incremental against
    /// `parent` when given. The caller owns locking.
    pub async fn transfer(
        &self,
        source: &dyn SendEndpoint,
        destination: &dyn Endpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<TransferOutcome> {
        let source_id = source.as_endpoint().id();
        let destination_id = destination.id();
        let record = |status: TransactionStatus| {
            TransactionRecord::new("transfer", status, &source_id, &destination_id, &snapshot.name())
                .with_parent(parent.map(|p| p.name()))
        };

        self.log.record(&record(TransactionStatus::Started)).await;
        let start = Instant::now();
        let result = self.execute(source, destination, snapshot, parent).await;
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                self.log
                    .record(
                        &record(TransactionStatus::Completed)
                            .with_duration(elapsed)
                            .with_size(outcome.bytes),
                    )
                    .await
            }
            Err(e) => {
                self.log
                    .record(&record(TransactionStatus::Failed).with_duration(elapsed).with_error(e))
                    .await
            }
        }
        result
    }

    async fn execute(
        &self,
        source: &dyn SendEndpoint,
        destination: &dyn Endpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<TransferOutcome> {
        destination.prepare().await?;

        let estimate = if self.options.check_space || self.options.progress {
            self.estimate(source, snapshot, parent).await
        } else {
            None
        };
        if self.options.check_space {
            self.check_space(destination, estimate).await?;
        }

        if let Some(chunked) = &self.chunked {
            return chunked.transfer(source, destination, snapshot, parent).await;
        }
        self.run_pipeline(source, destination, snapshot, parent, estimate).await
    }

    /// Size estimate for the stream. Failures are logged and ignored.
    async fn estimate(&self, source: &dyn SendEndpoint, snapshot: &Snapshot, parent: Option<&Snapshot>) -> Option<u64> {
        match source.estimate_size(snapshot, parent).await {
            Ok(size) => {
                debug!(snapshot = %snapshot, size, "Estimated stream size");
                Some(size)
            }
            Err(e) => {
                warn!(snapshot = %snapshot, "Could not estimate transfer size: {}", e);
                None
            }
        }
    }

    /// Compare the estimate with free space at the destination. Only a
    /// confirmed shortage fails, and only without `force`.
    async fn check_space(&self, destination: &dyn Endpoint, estimate: Option<u64>) -> Result<()> {
        let Some(estimate) = estimate else {
            return Ok(());
        };
        let space = match destination.get_space_info().await {
            Ok(space) => space,
            Err(e) => {
                warn!(destination = %destination.id(), "Skipping space check: {}", e);
                return Ok(());
            }
        };

        let required = required_space(estimate, self.options.space_margin_percent);
        if required <= space.free_bytes {
            return Ok(());
        }
        if self.options.force {
            warn!(
                destination = %destination.id(),
                "Transfer needs about {} but only {} is free; continuing because force is set",
                format_bytes(required),
                format_bytes(space.free_bytes)
            );
            return Ok(());
        }
        Err(AgentError::InsufficientSpace {
            destination: destination.id(),
            required,
            available: space.free_bytes,
        })
    }

    fn filters(&self) -> Vec<FilterSpec> {
        let mut filters = Vec::new();
        if let Some(compression) = self.options.compression {
            filters.push(FilterSpec::new("compress", compression.compress_argv()));
        }
        if let Some(rate) = &self.options.rate_limit {
            filters.push(FilterSpec::new("rate-limit", rate_limit_argv(rate)));
        }
        filters
    }

    async fn run_pipeline(
        &self,
        source: &dyn SendEndpoint,
        destination: &dyn Endpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        estimate: Option<u64>,
    ) -> Result<TransferOutcome> {
        let strategy = self.strategy_for(destination);
        let filters = self.filters();
        let receive_options = ReceiveOptions {
            decompress: self.options.compression,
        };

        let mode = match strategy {
            TransportStrategy::Filtered => ProgressMode::choose(
                self.options.progress,
                estimate,
                !filters.is_empty(),
                ProgressMode::stderr_is_terminal(),
            ),
            _ => ProgressMode::Quiet,
        };
        let label = format!("{} -> {}", snapshot, destination.id());
        let reporter = ProgressReporter::new(label.clone(), mode, estimate);

        let parent_name = parent.map(|p| p.name());
        info!(
            snapshot = %snapshot,
            parent = parent_name.as_deref().unwrap_or("-"),
            destination = %destination.id(),
            strategy = %strategy,
            "Starting transfer"
        );

        let start = Instant::now();
        let send = source.send(snapshot, parent, &[])?;
        let pipeline = Pipeline::start(
            send,
            &filters,
            destination,
            &receive_options,
            strategy,
            Some(reporter.callback()),
        )?;
        let heartbeat = (strategy == TransportStrategy::DirectPipe && self.options.progress)
            .then(|| Heartbeat::start(label, LOG_INTERVAL));
        let report = pipeline.finish(&self.options.timeouts).await;
        drop(heartbeat);

        if !report.succeeded() {
            let failed: Vec<String> = report.failures.iter().map(|f| f.command.clone()).collect();
            return Err(SnapshotTransferError::new(
                snapshot.name(),
                format!("{} stage(s) failed: {}", failed.len(), failed.join(", ")),
            )
            .with_stages(report.failures)
            .into());
        }

        if let Some(bytes) = report.bytes {
            reporter.finish(bytes);
        }
        let duration = start.elapsed();
        info!(
            snapshot = %snapshot,
            destination = %destination.id(),
            "Transfer finished in {:.1}s",
            duration.as_secs_f64()
        );

        Ok(TransferOutcome {
            bytes: report.bytes,
            duration,
            strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::test_support::{fake_btrfs, make_snapshot};
    use crate::endpoint::{LocalEndpoint, ShellEndpoint};
    use crate::snapshot::test_support::snap;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        source: LocalEndpoint,
        dest: LocalEndpoint,
        log_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let btrfs = fake_btrfs(tmp.path()).to_string_lossy().into_owned();
        let source = LocalEndpoint::new(tmp.path().join("src"), "h-").with_btrfs_command(&btrfs);
        let dest = LocalEndpoint::new(tmp.path().join("dst"), "h-").with_btrfs_command(&btrfs);
        std::fs::create_dir_all(source.dir()).unwrap();
        let log_path = tmp.path().join("transactions.jsonl");
        Fixture {
            _tmp: tmp,
            source,
            dest,
            log_path,
        }
    }

    fn engine(options: TransferOptions, log: &std::path::Path) -> TransferEngine {
        TransferEngine::new(options).with_transaction_log(TransactionLog::new(Some(log.to_path_buf())))
    }

    fn quiet() -> TransferOptions {
        TransferOptions {
            progress: false,
            check_space: false,
            ..TransferOptions::default()
        }
    }

    #[test]
    fn test_required_space() {
        assert_eq!(required_space(1000, 10), 1100);
        assert_eq!(required_space(0, 50), 0);
        assert_eq!(required_space(u64::MAX, 10), u64::MAX);
    }

    #[tokio::test]
    async fn test_local_transfer_and_transaction_log() {
        let f = fixture();
        let s = snap("h-", 1);
        make_snapshot(f.source.dir(), &s.name(), b"snapshot payload");

        let outcome = engine(quiet(), &f.log_path)
            .transfer(&f.source, &f.dest, &s, None)
            .await
            .unwrap();

        assert_eq!(outcome.strategy, TransportStrategy::Filtered);
        assert_eq!(outcome.bytes, Some((s.name().len() + 1 + 16) as u64));
        let received = std::fs::read(f.dest.dir().join(s.name()).join("data")).unwrap();
        assert_eq!(received, b"snapshot payload");

        let log = std::fs::read_to_string(&f.log_path).unwrap();
        let statuses: Vec<String> = log
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["status"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(statuses, vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn test_compressed_transfer() {
        let f = fixture();
        let s = snap("h-", 1);
        make_snapshot(f.source.dir(), &s.name(), b"compress me");

        let options = TransferOptions {
            compression: Some(Compression::Gzip),
            ..quiet()
        };
        engine(options, &f.log_path)
            .transfer(&f.source, &f.dest, &s, None)
            .await
            .unwrap();

        let received = std::fs::read(f.dest.dir().join(s.name()).join("data")).unwrap();
        assert_eq!(received, b"compress me");
    }

    #[tokio::test]
    async fn test_failed_receive_is_a_transfer_error() {
        let f = fixture();
        let s = snap("h-", 1);
        make_snapshot(f.source.dir(), &s.name(), b"data");
        let broken = ShellEndpoint::new("cat > /dev/null; echo 'disk on fire' >&2; exit 1", "h-");

        let err = engine(quiet(), &f.log_path)
            .transfer(&f.source, &broken, &s, None)
            .await
            .unwrap_err();

        assert!(err.is_transfer_failure());
        assert!(err.to_string().contains("disk on fire"));
        let log = std::fs::read_to_string(&f.log_path).unwrap();
        assert!(log.lines().last().unwrap().contains("\"failed\""));
    }

    #[tokio::test]
    async fn test_space_check_blocks_without_force() {
        let f = fixture();
        let s = snap("h-", 1);
        make_snapshot(f.source.dir(), &s.name(), &[7u8; 4096]);

        // A margin this large can never fit.
        let options = TransferOptions {
            check_space: true,
            space_margin_percent: u64::MAX / 4096,
            ..quiet()
        };
        let err = engine(options.clone(), &f.log_path)
            .transfer(&f.source, &f.dest, &s, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InsufficientSpace { .. }));
        assert!(!f.dest.dir().join(s.name()).exists());

        let forced = TransferOptions { force: true, ..options };
        engine(forced, &f.log_path)
            .transfer(&f.source, &f.dest, &s, None)
            .await
            .unwrap();
        assert!(f.dest.dir().join(s.name()).exists());
    }

    #[tokio::test]
    async fn test_space_check_skipped_when_unsupported() {
        let f = fixture();
        let s = snap("h-", 1);
        make_snapshot(f.source.dir(), &s.name(), b"data");
        let shell = ShellEndpoint::new("cat > /dev/null", "h-");

        let options = TransferOptions {
            check_space: true,
            ..quiet()
        };
        engine(options, &f.log_path)
            .transfer(&f.source, &shell, &s, None)
            .await
            .unwrap();
    }

    #[test]
    fn test_strategy_selection() {
        let engine = TransferEngine::new(TransferOptions::default());
        let local = LocalEndpoint::new("/tmp/x", "h-");
        assert_eq!(engine.strategy_for(&local), TransportStrategy::Filtered);

        let ssh = crate::endpoint::build_endpoint("ssh://host/b", &crate::endpoint::EndpointSettings::new("h-")).unwrap();
        assert_eq!(engine.strategy_for(ssh.as_ref()), TransportStrategy::DirectPipe);
    }
}
