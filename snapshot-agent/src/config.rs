//! Configuration management for the snapshot agent.
//!
//! Loads configuration from a TOML file. Every section is optional and falls
//! back to the defaults below.
//!
//! ```toml
//! transaction_log = "/var/log/snapshot-agent/transactions.jsonl"
//!
//! [transfer]
//! compression = "zstd"
//!
//! [[jobs]]
//! name = "home"
//! source = "/home"
//! snapshot_dir = "/.snapshots/home"
//! prefix = "home-"
//! keep_snapshots = 24
//! targets = ["/mnt/backup/home", "ssh://backup@nas:22/srv/backup/home"]
//! ```

use crate::endpoint::EndpointSettings;
use crate::transfer::chunked::{ChunkedTransferEngine, DEFAULT_CHUNK_SIZE};
use crate::transfer::filters::Compression;
use crate::transfer::transaction_log::TransactionLog;
use crate::transfer::{StageTimeouts, TransferEngine, TransferOptions};
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    /// JSON-lines transaction log. Records only go to the tracing log when unset.
    #[serde(default)]
    pub transaction_log: Option<PathBuf>,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Stream compression (zstd, gzip, lz4)
    #[serde(default)]
    pub compression: Option<Compression>,

    /// Bandwidth limit passed to `pv -L`, e.g. "20M"
    #[serde(default)]
    pub rate_limit: Option<String>,

    #[serde(default = "default_true")]
    pub progress: bool,

    #[serde(default = "default_true")]
    pub check_space: bool,

    #[serde(default = "default_space_margin_percent")]
    pub space_margin_percent: u64,

    /// Transfer even if the space check fails
    #[serde(default)]
    pub force: bool,

    /// Always send full streams
    #[serde(default)]
    pub no_incremental: bool,

    /// Use resumable chunked transfers
    #[serde(default)]
    pub chunked: bool,

    /// Chunk size in bytes (default: 64MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Staging area for chunked transfers
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_send_secs")]
    pub send_secs: u64,

    #[serde(default = "default_filter_secs")]
    pub filter_secs: u64,

    /// Counted from the end of the upstream stages
    #[serde(default = "default_receive_secs")]
    pub receive_secs: u64,

    /// Listing, `df`, `mkdir`, deletions and lock file updates
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_btrfs")]
    pub btrfs: String,

    #[serde(default = "default_ssh")]
    pub ssh: String,

    /// Extra options for every ssh invocation, e.g. ["-i", "/root/.ssh/backup"]
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    /// Subvolume to snapshot. Jobs without one only sync existing snapshots.
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Directory holding the local snapshots
    pub snapshot_dir: PathBuf,

    pub prefix: String,

    /// Unlocked snapshots kept on the source (0 = keep all)
    #[serde(default)]
    pub keep_snapshots: usize,

    /// Unlocked snapshots kept on each target (0 = keep all)
    #[serde(default)]
    pub keep_backups: usize,

    #[serde(default = "default_true")]
    pub take_snapshot: bool,

    /// Target URLs: a path, ssh://[user@]host[:port]/path or shell://<command>
    #[serde(default)]
    pub targets: Vec<String>,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_space_margin_percent() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapshot-agent/chunks")
}

fn default_send_secs() -> u64 {
    3600
}

fn default_filter_secs() -> u64 {
    3600
}

fn default_receive_secs() -> u64 {
    300
}

fn default_command_secs() -> u64 {
    120
}

fn default_btrfs() -> String {
    "btrfs".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compression: None,
            rate_limit: None,
            progress: true,
            check_space: true,
            space_margin_percent: default_space_margin_percent(),
            force: false,
            no_incremental: false,
            chunked: false,
            chunk_size: default_chunk_size(),
            chunk_dir: default_chunk_dir(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            send_secs: default_send_secs(),
            filter_secs: default_filter_secs(),
            receive_secs: default_receive_secs(),
            command_secs: default_command_secs(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            btrfs: default_btrfs(),
            ssh: default_ssh(),
            ssh_options: Vec::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            send: Duration::from_secs(self.send_secs),
            filter: Duration::from_secs(self.filter_secs),
            receive: Duration::from_secs(self.receive_secs),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config {
            log: LogConfig::default(),
            transfer: TransferConfig::default(),
            timeouts: TimeoutConfig::default(),
            commands: CommandConfig::default(),
            transaction_log: None,
            jobs: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(AgentError::Config("transfer.chunk_size must be positive".into()));
        }
        for job in &self.jobs {
            if job.prefix.is_empty() {
                return Err(AgentError::Config(format!("job '{}' has an empty prefix", job.name)));
            }
            if job.take_snapshot && job.source.is_none() {
                return Err(AgentError::Config(format!(
                    "job '{}' takes snapshots but has no source subvolume",
                    job.name
                )));
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            compression: self.transfer.compression,
            rate_limit: self.transfer.rate_limit.clone(),
            progress: self.transfer.progress,
            check_space: self.transfer.check_space,
            space_margin_percent: self.transfer.space_margin_percent,
            force: self.transfer.force,
            timeouts: self.timeouts.stage_timeouts(),
        }
    }

    /// Transfer engine for every job, chunked when configured.
    pub fn transfer_engine(&self) -> TransferEngine {
        let mut engine = TransferEngine::new(self.transfer_options())
            .with_transaction_log(TransactionLog::new(self.transaction_log.clone()));
        if self.transfer.chunked {
            engine = engine.with_chunked(ChunkedTransferEngine::new(
                self.transfer.chunk_dir.clone(),
                self.transfer.chunk_size,
                self.timeouts.stage_timeouts(),
            ));
        }
        engine
    }

    pub fn endpoint_settings(&self, prefix: &str) -> EndpointSettings {
        EndpointSettings {
            prefix: prefix.to_string(),
            btrfs_command: self.commands.btrfs.clone(),
            ssh_command: self.commands.ssh.clone(),
            ssh_options: self.commands.ssh_options.clone(),
            command_timeout: self.timeouts.command_timeout(),
        }
    }
}
