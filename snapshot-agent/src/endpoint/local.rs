//! Snapshot directories on the local machine.

use super::{
    count_output_bytes, parse_du_total, run_command, spawn_stage, Endpoint, ReceiveOptions, SendEndpoint,
    SpaceInfo, SpawnedProcess, DEFAULT_COMMAND_TIMEOUT,
};
use crate::locks::{LocalLockFile, LockMutation, LockStore, LockTable};
use crate::snapshot::{Snapshot, SnapshotCatalog};
use crate::transfer::filters::with_decompression;
use crate::utils::errors::{AgentError, Result};
use crate::utils::shell as sh;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

/// A local snapshot directory. Usable as a destination and as a send source
/// for restores, but it cannot take new snapshots.
pub struct LocalEndpoint {
    dir: PathBuf,
    prefix: String,
    btrfs: String,
    host: String,
    command_timeout: Duration,
    catalog: SnapshotCatalog,
    locks: LocalLockFile,
}

impl LocalEndpoint {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        let dir = dir.into();
        let prefix = prefix.into();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            catalog: SnapshotCatalog::new(&dir, &prefix),
            locks: LocalLockFile::in_dir(&dir),
            dir,
            prefix,
            btrfs: "btrfs".to_string(),
            host,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use a different `btrfs` executable.
    pub fn with_btrfs_command(mut self, btrfs: impl Into<String>) -> Self {
        self.btrfs = btrfs.into();
        self
    }

    /// Limit for `btrfs` calls other than send and receive.
    pub fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = limit;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn btrfs_argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.btrfs.clone())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    async fn read_entries(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| AgentError::Io(e.into()))?;
                if entry.file_type().is_dir() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Ok(names)
        })
        .await
        .map_err(|e| AgentError::Command(format!("listing task failed: {}", e)))?
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn id(&self) -> String {
        format!("local://{}{}", self.host, self.dir.display())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn prepare(&self) -> Result<()> {
        if !self.dir.exists() {
            info!(dir = %self.dir.display(), "Creating snapshot directory");
            tokio::fs::create_dir_all(&self.dir).await?;
        }
        Ok(())
    }

    fn receive(&self, stdin: Stdio, options: &ReceiveOptions) -> Result<SpawnedProcess> {
        let receive = self.btrfs_argv(&["receive", &Self::path_arg(&self.dir)]);
        let argv = match options.decompress {
            None => receive,
            Some(c) => with_decompression(&sh::join(&receive)?, Some(c)),
        };
        spawn_stage("receive", &argv, stdin, Stdio::null())
    }

    async fn list_snapshots(&self, flush_cache: bool) -> Result<Vec<Snapshot>> {
        self.catalog
            .list_with(flush_cache, || self.read_entries())
            .await
    }

    async fn register_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.catalog.add(snapshot).await
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
                info!(snapshot = %snapshot, "Skipping deletion of locked snapshot");
                continue;
            }
            let path = self.dir.join(snapshot.name());
            let argv = self.btrfs_argv(&["subvolume", "delete", &Self::path_arg(&path)]);
            match run_command(&argv, None, self.command_timeout).await {
                Ok(_) => {
                    info!(snapshot = %snapshot, "Deleted snapshot");
                    deleted.push(snapshot.clone());
                }
                Err(e) => warn!(snapshot = %snapshot, "Failed to delete snapshot: {}", e),
            }
        }

        self.catalog.invalidate().await;
        Ok(deleted)
    }

    async fn get_space_info(&self) -> Result<SpaceInfo> {
        let dir = self.dir.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&dir))
            .await
            .map_err(|e| AgentError::Command(format!("statvfs task failed: {}", e)))?
            .map_err(|e| AgentError::Io(e.into()))?;
        let fragment = stat.fragment_size() as u64;
        Ok(SpaceInfo {
            free_bytes: stat.blocks_available() as u64 * fragment,
            total_bytes: stat.blocks() as u64 * fragment,
        })
    }
}

#[async_trait]
impl SendEndpoint for LocalEndpoint {
    fn send(&self, snapshot: &Snapshot, parent: Option<&Snapshot>, clones: &[Snapshot]) -> Result<SpawnedProcess> {
        let mut args = vec!["send".to_string()];
        if let Some(parent) = parent {
            args.push("-p".into());
            args.push(Self::path_arg(&self.dir.join(parent.name())));
        }
        for clone in clones {
            args.push("-c".into());
            args.push(Self::path_arg(&self.dir.join(clone.name())));
        }
        args.push(Self::path_arg(&self.dir.join(snapshot.name())));

        let argv: Vec<String> = std::iter::once(self.btrfs.clone()).chain(args).collect();
        spawn_stage("send", &argv, Stdio::null(), Stdio::piped())
    }

    async fn estimate_size(&self, snapshot: &Snapshot, parent: Option<&Snapshot>) -> Result<u64> {
        let path = Self::path_arg(&self.dir.join(snapshot.name()));
        match parent {
            Some(parent) => {
                let parent_path = Self::path_arg(&self.dir.join(parent.name()));
                let argv = self.btrfs_argv(&["send", "--no-data", "-p", &parent_path, &path]);
                count_output_bytes(&argv, self.command_timeout).await
            }
            None => {
                let argv = self.btrfs_argv(&["filesystem", "du", "-s", "--raw", &path]);
                let output = run_command(&argv, None, self.command_timeout).await?;
                parse_du_total(&output)
            }
        }
    }

    fn as_endpoint(&self) -> &dyn Endpoint {
        self
    }
}

/// A local snapshot directory bound to the subvolume it snapshots.
pub struct LocalSource {
    subvolume: PathBuf,
    endpoint: LocalEndpoint,
}

impl LocalSource {
    pub fn new(subvolume: impl Into<PathBuf>, endpoint: LocalEndpoint) -> Self {
        Self {
            subvolume: subvolume.into(),
            endpoint,
        }
    }

    pub fn subvolume(&self) -> &Path {
        &self.subvolume
    }

    pub fn endpoint(&self) -> &LocalEndpoint {
        &self.endpoint
    }

    pub fn into_endpoint(self) -> LocalEndpoint {
        self.endpoint
    }

    /// Take a read-only snapshot of the subvolume, named after the current time.
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        self.endpoint.prepare().await?;

        let snapshot = Snapshot::now(self.endpoint.dir(), self.endpoint.prefix());
        let path = snapshot.path();
        if path.exists() {
            return Err(AgentError::Snapshot(format!(
                "snapshot {} already exists",
                path.display()
            )));
        }

        let argv = self.endpoint.btrfs_argv(&[
            "subvolume",
            "snapshot",
            "-r",
            &LocalEndpoint::path_arg(&self.subvolume),
            &LocalEndpoint::path_arg(&path),
        ]);
        run_command(&argv, None, self.endpoint.command_timeout).await?;
        info!(snapshot = %snapshot, subvolume = %self.subvolume.display(), "Created snapshot");

        self.endpoint.register_snapshot(&snapshot).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::test_support::{fake_btrfs, make_snapshot};
    use crate::snapshot::test_support::snap;
    use tempfile::TempDir;

    fn endpoint(tmp: &TempDir) -> LocalEndpoint {
        let btrfs = fake_btrfs(tmp.path());
        LocalEndpoint::new(tmp.path().join("snapshots"), "h-").with_btrfs_command(btrfs.to_string_lossy())
    }

    #[tokio::test]
    async fn test_list_ignores_files_and_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.prepare().await.unwrap();

        make_snapshot(ep.dir(), &snap("h-", 2).name(), b"two");
        make_snapshot(ep.dir(), &snap("h-", 1).name(), b"one");
        make_snapshot(ep.dir(), "other-20240101-000100", b"x");
        std::fs::write(ep.dir().join("h-20240101-000300"), b"not a dir").unwrap();

        let list = ep.list_snapshots(true).await.unwrap();
        assert_eq!(list, vec![snap("h-", 1), snap("h-", 2)]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        assert!(ep.list_snapshots(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_skips_locked() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.prepare().await.unwrap();
        let a = snap("h-", 1);
        let b = snap("h-", 2);
        make_snapshot(ep.dir(), &a.name(), b"a");
        make_snapshot(ep.dir(), &b.name(), b"b");

        ep.set_lock(&a, "dest", true, false).await.unwrap();
        let deleted = ep.delete_snapshots(&[a.clone(), b.clone()]).await.unwrap();

        assert_eq!(deleted, vec![b.clone()]);
        assert!(ep.dir().join(a.name()).exists());
        assert!(!ep.dir().join(b.name()).exists());
        assert_eq!(ep.list_snapshots(false).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_clear_locks() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.prepare().await.unwrap();
        let a = snap("h-", 1);

        ep.set_lock(&a, "dest", true, false).await.unwrap();
        ep.set_lock(&a, "dest", true, true).await.unwrap();
        let affected = ep.clear_locks("dest").await.unwrap();
        assert_eq!(affected, vec![a.name()]);
        assert!(!ep.lock_table().await.unwrap().is_locked(&a));
    }

    #[tokio::test]
    async fn test_create_snapshot_registers() {
        let tmp = TempDir::new().unwrap();
        let subvolume = tmp.path().join("home");
        std::fs::create_dir_all(&subvolume).unwrap();
        std::fs::write(subvolume.join("data"), b"payload").unwrap();

        let source = LocalSource::new(&subvolume, endpoint(&tmp));
        source.endpoint().list_snapshots(false).await.unwrap();
        let created = source.create_snapshot().await.unwrap();

        assert!(created.path().join("data").exists());
        let cached = source.endpoint().list_snapshots(false).await.unwrap();
        assert_eq!(cached, vec![created]);
    }

    #[tokio::test]
    async fn test_estimate_full_size() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.prepare().await.unwrap();
        let a = snap("h-", 1);
        make_snapshot(ep.dir(), &a.name(), &[0u8; 1000]);

        assert_eq!(ep.estimate_size(&a, None).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_space_info() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.prepare().await.unwrap();
        let info = ep.get_space_info().await.unwrap();
        assert!(info.total_bytes >= info.free_bytes);
        assert!(info.total_bytes > 0);
    }

    #[test]
    fn test_id_is_stable() {
        let a = LocalEndpoint::new("/mnt/backups", "h-");
        let b = LocalEndpoint::new("/mnt/backups", "h-");
        assert_eq!(a.id(), b.id());
        assert!(a.id().ends_with("/mnt/backups"));
    }
}
