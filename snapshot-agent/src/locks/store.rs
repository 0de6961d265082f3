//! Persistence of lock tables.
//!
//! Every mutation is a full read-modify-write of the lock file under an OS
//! advisory lock, so concurrent writers cannot corrupt the file and a reader
//! always sees a complete table. The advisory lock does not serialize the
//! logical decisions of two orchestrators.

use super::{LockMutation, LockTable};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default lock file name inside a snapshot directory.
pub const LOCK_FILE_NAME: &str = ".outstanding_transfers";

/// Storage for one endpoint's lock table.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Read the current table.
    async fn load(&self) -> Result<LockTable>;

    /// Apply one mutation and persist the whole table. Returns the new table.
    async fn update(&self, mutation: LockMutation) -> Result<LockTable>;
}

/// Lock file on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalLockFile {
    path: PathBuf,
}

impl LocalLockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The default lock file of a snapshot directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(LOCK_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        path.with_file_name(name)
    }

    fn open_guard(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(Self::guard_path(path))
            .map_err(|e| AgentError::LockFile(format!("failed to open lock guard for {}: {}", path.display(), e)))
    }

    fn read_table(path: &Path) -> Result<LockTable> {
        match fs::read_to_string(path) {
            Ok(content) => LockTable::parse(&content).map_err(|e| {
                AgentError::LockFile(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockTable::new()),
            Err(e) => Err(AgentError::LockFile(format!("failed to read {}: {}", path.display(), e))),
        }
    }

    fn write_table(path: &Path, table: &LockTable) -> Result<()> {
        let json = table.to_json()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load_blocking(path: &Path) -> Result<LockTable> {
        let guard = Self::open_guard(path)?;
        FileExt::lock_shared(&guard)
            .map_err(|e| AgentError::LockFile(format!("failed to lock {}: {}", path.display(), e)))?;
        let result = Self::read_table(path);
        let _ = FileExt::unlock(&guard);
        result
    }

    fn update_blocking(path: &Path, mutation: &LockMutation) -> Result<LockTable> {
        let guard = Self::open_guard(path)?;
        FileExt::lock_exclusive(&guard)
            .map_err(|e| AgentError::LockFile(format!("failed to lock {}: {}", path.display(), e)))?;

        let result = Self::read_table(path).and_then(|mut table| {
            table.apply(mutation);
            Self::write_table(path, &table)?;
            Ok(table)
        });

        let _ = FileExt::unlock(&guard);
        result
    }
}

#[async_trait]
impl LockStore for LocalLockFile {
    async fn load(&self) -> Result<LockTable> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(&path))
            .await
            .map_err(|e| AgentError::LockFile(format!("lock file task failed: {}", e)))?
    }

    async fn update(&self, mutation: LockMutation) -> Result<LockTable> {
        let path = self.path.clone();
        debug!(path = %path.display(), ?mutation, "Updating lock file");
        tokio::task::spawn_blocking(move || Self::update_blocking(&path, &mutation))
            .await
            .map_err(|e| AgentError::LockFile(format!("lock file task failed: {}", e)))?
    }
}
