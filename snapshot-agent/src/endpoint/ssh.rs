//! Snapshot directories on a remote host, reached over SSH.

use super::{
    count_output_bytes, parse_du_total, run_command, spawn_stage, Endpoint, EndpointSettings, ReceiveOptions,
    SendEndpoint, SpaceInfo, SpawnedProcess, DEFAULT_COMMAND_TIMEOUT,
};
use crate::locks::store::LOCK_FILE_NAME;
use crate::locks::{LockMutation, LockStore, LockTable};
use crate::snapshot::{Snapshot, SnapshotCatalog};
use crate::transfer::filters::with_decompression;
use crate::utils::errors::{AgentError, Result};
use crate::utils::shell as sh;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Printed by the remote lock script between the current table and the
/// point where it starts reading the replacement.
const TABLE_END_MARKER: &str = "--- end of lock table ---";

/// `ssh://[user@]host[:port]/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: PathBuf,
}

impl SshTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |why: &str| AgentError::Config(format!("invalid ssh target '{}': {}", url, why));

        let rest = url.strip_prefix("ssh://").ok_or_else(|| invalid("missing ssh:// scheme"))?;
        let slash = rest.find('/').ok_or_else(|| invalid("missing path"))?;
        let (authority, path) = rest.split_at(slash);

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, hp)) if !user.is_empty() => (Some(user.to_string()), hp),
            Some(_) => return Err(invalid("empty user")),
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
            path: PathBuf::from(path),
        })
    }

    /// `user@host` or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh://{}", self.destination())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.path.display())
    }
}

/// Builds local `ssh` invocations running one remote command line.
#[derive(Debug, Clone)]
pub struct SshCommand {
    program: String,
    options: Vec<String>,
    target: SshTarget,
    timeout: Duration,
}

impl SshCommand {
    pub fn new(program: impl Into<String>, options: Vec<String>, target: SshTarget) -> Self {
        Self {
            program: program.into(),
            options,
            target,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Limit for sessions other than send and receive streams.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn argv(&self, remote_command: &str) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.options.iter().cloned());
        if let Some(port) = self.target.port {
            argv.push("-p".into());
            argv.push(port.to_string());
        }
        argv.push(self.target.destination());
        argv.push(remote_command.to_string());
        argv
    }
}

/// Lock file in a remote snapshot directory.
///
/// An update is a single SSH session holding `flock` on the guard file for
/// the whole read-modify-write: the remote side prints the table, then reads
/// the replacement from stdin. The replacement must end with the marker line;
/// an empty or cut-off replacement leaves the file as it was. A session still
/// running after the command timeout is killed.
pub struct RemoteLockFile {
    ssh: SshCommand,
    path: String,
    local: Mutex<()>,
}

impl RemoteLockFile {
    pub fn new(ssh: SshCommand, path: impl Into<String>) -> Self {
        Self {
            ssh,
            path: path.into(),
            local: Mutex::new(()),
        }
    }

    fn guard(&self) -> String {
        format!("{}.lock", self.path)
    }

    fn read_script(&self) -> Result<String> {
        let path = sh::quote(&self.path)?;
        let inner = format!("if [ -f {p} ]; then cat {p}; fi", p = path);
        Ok(format!("flock -s {} sh -c {}", sh::quote(&self.guard())?, sh::quote(&inner)?))
    }

    fn update_script(&self) -> Result<String> {
        let path = sh::quote(&self.path)?;
        let tmp_path = format!("{}.tmp", self.path);
        let tmp = sh::quote(&tmp_path)?;
        let new_path = format!("{}.new", self.path);
        let new = sh::quote(&new_path)?;
        let inner = format!(
            r#"if [ -f {p} ]; then cat {p}; fi; echo; echo {marker}; cat > {t} && [ "$(tail -n 1 {t})" = {marker} ] && sed '$d' {t} > {n} && mv {n} {p}"#,
            p = path,
            t = tmp,
            n = new,
            marker = sh::quote(TABLE_END_MARKER)?,
        );
        Ok(format!("flock -x {} sh -c {}", sh::quote(&self.guard())?, sh::quote(&inner)?))
    }

    async fn update_session(&self, mutation: &LockMutation) -> Result<LockTable> {
        let mut process = spawn_stage("lock", &self.ssh.argv(&self.update_script()?), Stdio::piped(), Stdio::piped())?;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| self.lock_error("lock session has no stdout"))?;
        let mut stdin = process
            .child
            .stdin
            .take()
            .ok_or_else(|| self.lock_error("lock session has no stdin"))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut current = String::new();
        let mut terminated = false;
        while let Some(line) = lines.next_line().await? {
            if line == TABLE_END_MARKER {
                terminated = true;
                break;
            }
            current.push_str(&line);
            current.push('\n');
        }
        if !terminated {
            drop(stdin);
            let _ = process.child.wait().await;
            return Err(self.lock_error("lock session ended before the table was read"));
        }

        // On a parse failure stdin is closed without data and the file is kept.
        let mut table = match LockTable::parse(&current) {
            Ok(table) => table,
            Err(e) => {
                drop(stdin);
                let _ = process.child.wait().await;
                return Err(self.lock_error(e));
            }
        };
        table.apply(mutation);

        let json = table.to_json()?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(format!("\n{}\n", TABLE_END_MARKER).as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let status = process.child.wait().await?;
        if !status.success() {
            return Err(self.lock_error(format!("`{}` exited with {}", process.command, status)));
        }
        Ok(table)
    }

    fn lock_error(&self, e: impl fmt::Display) -> AgentError {
        AgentError::LockFile(format!("{}: {}", self.path, e))
    }
}

#[async_trait]
impl LockStore for RemoteLockFile {
    async fn load(&self) -> Result<LockTable> {
        let content = run_command(&self.ssh.argv(&self.read_script()?), None, self.ssh.timeout())
            .await
            .map_err(|e| self.lock_error(e))?;
        LockTable::parse(&content).map_err(|e| self.lock_error(e))
    }

    async fn update(&self, mutation: LockMutation) -> Result<LockTable> {
        let _local = self.local.lock().await;
        debug!(path = %self.path, ?mutation, "Updating remote lock file");

        let limit = self.ssh.timeout();
        match timeout(limit, self.update_session(&mutation)).await {
            Ok(result) => result,
            Err(_) => Err(self.lock_error(format!("lock session timed out after {:?}", limit))),
        }
    }
}

/// A snapshot directory on another host. Streams to it go straight from the
/// local send process into `ssh`.
pub struct SshEndpoint {
    target: SshTarget,
    prefix: String,
    btrfs: String,
    ssh: SshCommand,
    catalog: SnapshotCatalog,
    locks: RemoteLockFile,
}

impl SshEndpoint {
    pub fn new(target: SshTarget, settings: &EndpointSettings) -> Self {
        let ssh = SshCommand::new(&settings.ssh_command, settings.ssh_options.clone(), target.clone())
            .with_timeout(settings.command_timeout);
        let lock_path = target.path.join(LOCK_FILE_NAME).to_string_lossy().into_owned();
        Self {
            catalog: SnapshotCatalog::new(&target.path, &settings.prefix),
            locks: RemoteLockFile::new(ssh.clone(), lock_path),
            prefix: settings.prefix.clone(),
            btrfs: settings.btrfs_command.clone(),
            ssh,
            target,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn remote_path(&self, name: &str) -> String {
        self.target.path.join(name).to_string_lossy().into_owned()
    }

    fn dir(&self) -> String {
        self.target.path.to_string_lossy().into_owned()
    }

    fn btrfs_line(&self, args: &[&str]) -> Result<String> {
        let argv: Vec<&str> = std::iter::once(self.btrfs.as_str()).chain(args.iter().copied()).collect();
        sh::join(&argv)
    }

    fn send_line(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        clones: &[Snapshot],
        no_data: bool,
    ) -> Result<String> {
        let mut args = vec!["send".to_string()];
        if no_data {
            args.push("--no-data".into());
        }
        if let Some(parent) = parent {
            args.push("-p".into());
            args.push(self.remote_path(&parent.name()));
        }
        for clone in clones {
            args.push("-c".into());
            args.push(self.remote_path(&clone.name()));
        }
        args.push(self.remote_path(&snapshot.name()));
        let argv: Vec<&str> = std::iter::once(self.btrfs.as_str())
            .chain(args.iter().map(String::as_str))
            .collect();
        sh::join(&argv)
    }

    async fn remote(&self, line: &str) -> Result<String> {
        run_command(&self.ssh.argv(line), None, self.ssh.timeout()).await
    }
}

/// Parse `df -B1 --output=avail,size` output.
pub(crate) fn parse_df(output: &str) -> Result<SpaceInfo> {
    let numbers: Vec<u64> = output
        .lines()
        .skip(1)
        .flat_map(|line| line.split_whitespace())
        .filter_map(|field| field.parse().ok())
        .collect();
    match numbers.as_slice() {
        [free, total, ..] => Ok(SpaceInfo {
            free_bytes: *free,
            total_bytes: *total,
        }),
        _ => Err(AgentError::Command(format!("unexpected df output: {}", output.trim()))),
    }
}

#[async_trait]
impl Endpoint for SshEndpoint {
    fn id(&self) -> String {
        self.target.to_string()
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn supports_direct_pipe(&self) -> bool {
        true
    }

    async fn prepare(&self) -> Result<()> {
        self.remote(&sh::join(&["mkdir", "-p", &self.dir()])?).await?;
        Ok(())
    }

    fn receive(&self, stdin: Stdio, options: &ReceiveOptions) -> Result<SpawnedProcess> {
        let receive = self.btrfs_line(&["receive", &self.dir()])?;
        let line = match options.decompress {
            None => receive,
            Some(c) => sh::join(&with_decompression(&receive, Some(c)))?,
        };
        spawn_stage("receive", &self.ssh.argv(&line), stdin, Stdio::null())
    }

    async fn list_snapshots(&self, flush_cache: bool) -> Result<Vec<Snapshot>> {
        let dir_path = self.dir();
        let dir = sh::quote(&dir_path)?;
        let line = format!(
            "if [ -d {d} ]; then find {d} -mindepth 1 -maxdepth 1 -type d -printf '%f\\n'; fi",
            d = dir
        );
        self.catalog
            .list_with(flush_cache, || async {
                let output = self.remote(&line).await?;
                Ok(output.lines().map(str::to_string).collect())
            })
            .await
    }

    async fn register_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.catalog.add(&snapshot.relocated(&self.target.path)).await
    }

    async fn lock_table(&self) -> Result<LockTable> {
        self.locks.load().await
    }

    async fn set_lock(&self, snapshot: &Snapshot, lock_id: &str, active: bool, parent: bool) -> Result<()> {
        self.locks
            .update(LockMutation::set(snapshot, lock_id, active, parent))
            .await?;
        self.catalog.invalidate().await;
        Ok(())
    }

    async fn clear_locks(&self, lock_id: &str) -> Result<Vec<String>> {
        let affected = self.locks.load().await?.held_by(lock_id);
        self.locks
            .update(LockMutation::ClearId {
                lock_id: lock_id.to_string(),
            })
            .await?;
        self.catalog.invalidate().await;
        Ok(affected)
    }

    async fn delete_snapshots(&self, snapshots: &[Snapshot]) -> Result<Vec<Snapshot>> {
        let table = self.locks.load().await?;
        let mut deleted = Vec::new();

        for snapshot in snapshots {
            if table.is_locked(snapshot) {
                info!(snapshot = %snapshot, remote = %self.target, "Skipping deletion of locked snapshot");
                continue;
            }
            let line = self.btrfs_line(&["subvolume", "delete", &self.remote_path(&snapshot.name())])?;
            match self.remote(&line).await {
                Ok(_) => {
                    info!(snapshot = %snapshot, remote = %self.target, "Deleted snapshot");
                    deleted.push(snapshot.clone());
                }
                Err(e) => warn!(snapshot = %snapshot, remote = %self.target, "Failed to delete snapshot: {}", e),
            }
        }

        self.catalog.invalidate().await;
        Ok(deleted)
    }

    async fn get_space_info(&self) -> Result<SpaceInfo> {
        let output = self
            .remote(&sh::join(&["df", "-B1", "--output=avail,size", &self.dir()])?)
            .await?;
        parse_df(&output)
    }
}

#[async_trait]
impl SendEndpoint for SshEndpoint {
    fn send(&self, snapshot: &Snapshot, parent: Option<&Snapshot>, clones: &[Snapshot]) -> Result<SpawnedProcess> {
        let line = self.send_line(snapshot, parent, clones, false)?;
        spawn_stage("send", &self.ssh.argv(&line), Stdio::null(), Stdio::piped())
    }

    async fn estimate_size(&self, snapshot: &Snapshot, parent: Option<&Snapshot>) -> Result<u64> {
        match parent {
            Some(_) => {
                let line = self.send_line(snapshot, parent, &[], true)?;
                count_output_bytes(&self.ssh.argv(&line), self.ssh.timeout()).await
            }
            None => {
                let path = self.remote_path(&snapshot.name());
                let output = self
                    .remote(&self.btrfs_line(&["filesystem", "du", "-s", "--raw", &path])?)
                    .await?;
                parse_du_total(&output)
            }
        }
    }

    fn as_endpoint(&self) -> &dyn Endpoint {
        self
    }
}
