//! Endpoints: where snapshots live and how bytes get in and out.
//!
//! [`Endpoint`] is everything a destination must offer. [`SendEndpoint`] adds
//! the ability to produce send streams. Only [`local::LocalSource`] can take
//! new snapshots, because only it knows the source subvolume.

pub mod local;
pub mod shell;
pub mod ssh;

use crate::locks::LockTable;
use crate::snapshot::Snapshot;
use crate::transfer::filters::Compression;
use crate::utils::errors::{AgentError, Result};
use crate::utils::shell as sh;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub use local::{LocalEndpoint, LocalSource};
pub use shell::ShellEndpoint;
pub use ssh::{SshEndpoint, SshTarget};

/// Limit for auxiliary commands unless configured otherwise.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Free and total capacity of an endpoint's filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Decompress the incoming stream before handing it to `receive`.
    pub decompress: Option<Compression>,
}

/// A spawned process taking part in a transfer.
pub struct SpawnedProcess {
    /// Short stage label (`send`, `receive`, `compress`, ...).
    pub label: String,
    /// Printable command line, for error reports.
    pub command: String,
    pub child: Child,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("label", &self.label)
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .finish()
    }
}

/// Operations every destination supports.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable identity, used as the lock ID for transfers to this endpoint.
    fn id(&self) -> String;

    /// Snapshot name prefix handled by this endpoint.
    fn prefix(&self) -> &str;

    fn is_remote(&self) -> bool {
        false
    }

    /// True if a local send stage can feed this endpoint's receive directly.
    fn supports_direct_pipe(&self) -> bool {
        false
    }

    /// Make sure the snapshot directory exists.
    async fn prepare(&self) -> Result<()>;

    /// Spawn the receive side, reading the stream from `stdin`.
    fn receive(&self, stdin: Stdio, options: &ReceiveOptions) -> Result<SpawnedProcess>;

    /// Snapshots at this endpoint, ascending by time.
    async fn list_snapshots(&self, flush_cache: bool) -> Result<Vec<Snapshot>>;

    /// Record a snapshot that was just created or received.
    async fn register_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn lock_table(&self) -> Result<LockTable>;

    async fn set_lock(&self, snapshot: &Snapshot, lock_id: &str, active: bool, parent: bool) -> Result<()>;

    /// Release every lock held by `lock_id`. Returns the affected snapshot names.
    async fn clear_locks(&self, lock_id: &str) -> Result<Vec<String>>;

    /// Delete snapshots, skipping any that are locked. Returns what was deleted.
    async fn delete_snapshots(&self, snapshots: &[Snapshot]) -> Result<Vec<Snapshot>>;

    async fn get_space_info(&self) -> Result<SpaceInfo>;
}

/// An endpoint that can produce send streams.
#[async_trait]
pub trait SendEndpoint: Endpoint {
    /// Spawn `send` for `snapshot`, incremental against `parent` when given.
    fn send(&self, snapshot: &Snapshot, parent: Option<&Snapshot>, clones: &[Snapshot]) -> Result<SpawnedProcess>;

    /// Rough size of the stream `send` would produce.
    async fn estimate_size(&self, snapshot: &Snapshot, parent: Option<&Snapshot>) -> Result<u64>;

    fn as_endpoint(&self) -> &dyn Endpoint;
}

/// Where a target URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetUrl {
    Local(PathBuf),
    Ssh(SshTarget),
    Shell(String),
}

impl TargetUrl {
    /// Accepts a plain path, `ssh://[user@]host[:port]/path` or `shell://<command>`.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(command) = url.strip_prefix("shell://") {
            if command.trim().is_empty() {
                return Err(AgentError::Config("shell target without a command".into()));
            }
            return Ok(TargetUrl::Shell(command.to_string()));
        }
        if url.starts_with("ssh://") {
            return SshTarget::parse(url).map(TargetUrl::Ssh);
        }
        if url.contains("://") {
            return Err(AgentError::Config(format!("unsupported target URL '{}'", url)));
        }
        if url.is_empty() {
            return Err(AgentError::Config("empty target path".into()));
        }
        Ok(TargetUrl::Local(PathBuf::from(url)))
    }
}

/// Endpoint construction settings shared by all targets of a job.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub prefix: String,
    pub btrfs_command: String,
    pub ssh_command: String,
    pub ssh_options: Vec<String>,
    /// Upper bound for listing, `df`, deletions and lock file updates.
    pub command_timeout: Duration,
}

impl EndpointSettings {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            btrfs_command: "btrfs".into(),
            ssh_command: "ssh".into(),
            ssh_options: Vec::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Build a destination endpoint for a target URL.
pub fn build_endpoint(url: &str, settings: &EndpointSettings) -> Result<Box<dyn Endpoint>> {
    Ok(match TargetUrl::parse(url)? {
        TargetUrl::Local(dir) => Box::new(
            LocalEndpoint::new(dir, &settings.prefix)
                .with_btrfs_command(&settings.btrfs_command)
                .with_command_timeout(settings.command_timeout),
        ),
        TargetUrl::Ssh(target) => Box::new(SshEndpoint::new(target, settings)),
        TargetUrl::Shell(command) => Box::new(ShellEndpoint::new(command, &settings.prefix)),
    })
}

/// Build an endpoint that can be sent from, e.g. a backup location to restore from.
pub fn build_send_endpoint(url: &str, settings: &EndpointSettings) -> Result<Box<dyn SendEndpoint>> {
    Ok(match TargetUrl::parse(url)? {
        TargetUrl::Local(dir) => Box::new(
            LocalEndpoint::new(dir, &settings.prefix)
                .with_btrfs_command(&settings.btrfs_command)
                .with_command_timeout(settings.command_timeout),
        ),
        TargetUrl::Ssh(target) => Box::new(SshEndpoint::new(target, settings)),
        TargetUrl::Shell(_) => {
            return Err(AgentError::Unsupported(format!("cannot send from shell target '{}'", url)))
        }
    })
}

/// Spawn one transfer stage with piped stderr.
pub fn spawn_stage(label: &str, argv: &[String], stdin: Stdio, stdout: Stdio) -> Result<SpawnedProcess> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::Config(format!("empty command for stage '{}'", label)))?;
    let command = sh::join(argv)?;
    let child = Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Command(format!("failed to start `{}`: {}", command, e)))?;

    Ok(SpawnedProcess {
        label: label.to_string(),
        command,
        child,
    })
}

/// Run a short auxiliary command to completion and return its stdout. A
/// command still running after `limit` is killed.
pub async fn run_command(argv: &[String], input: Option<&[u8]>, limit: Duration) -> Result<String> {
    let command = sh::join(argv)?;
    match timeout(limit, run_to_end(argv, &command, input)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Command(format!("`{}` timed out after {:?}", command, limit))),
    }
}

async fn run_to_end(argv: &[String], command: &str, input: Option<&[u8]>) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::Config("empty command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Command(format!("failed to start `{}`: {}", command, e)))?;

    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(data).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(AgentError::Command(format!(
            "`{}` exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Count the bytes a command writes to stdout.
pub async fn count_output_bytes(argv: &[String], limit: Duration) -> Result<u64> {
    let mut process = spawn_stage("estimate", argv, Stdio::null(), Stdio::piped())?;
    let command = process.command.clone();
    match timeout(limit, count_to_end(&mut process)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Command(format!("`{}` timed out after {:?}", command, limit))),
    }
}

async fn count_to_end(process: &mut SpawnedProcess) -> Result<u64> {
    let mut stdout = process
        .child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Command(format!("`{}` has no stdout", process.command)))?;
    let counted = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
    let status = process.child.wait().await?;
    if !status.success() {
        return Err(AgentError::Command(format!("`{}` exited with {}", process.command, status)));
    }
    Ok(counted)
}

/// Parse the "Total" column of `btrfs filesystem du -s --raw`.
pub fn parse_du_total(output: &str) -> Result<u64> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("Total"))
        .find_map(|line| line.split_whitespace().next()?.parse::<u64>().ok())
        .ok_or_else(|| AgentError::Command(format!("unexpected du output: {}", output.trim())))
}
