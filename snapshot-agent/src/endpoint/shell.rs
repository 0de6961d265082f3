//! A destination that pipes the stream into an arbitrary shell command.
//!
//! Nothing is stored anywhere the agent can list, so every transfer is a full
//! one and locking and retention do nothing.

use super::{spawn_stage, Endpoint, ReceiveOptions, SpaceInfo, SpawnedProcess};
use crate::locks::LockTable;
use crate::snapshot::Snapshot;
use crate::transfer::filters::with_decompression;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use std::process::Stdio;

pub struct ShellEndpoint {
    command: String,
    prefix: String,
}

impl ShellEndpoint {
    pub fn new(command: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            prefix: prefix.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Endpoint for ShellEndpoint {
    fn id(&self) -> String {
        format!("shell://{}", self.command)
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn receive(&self, stdin: Stdio, options: &ReceiveOptions) -> Result<SpawnedProcess> {
        let argv = with_decompression(&self.command, options.decompress);
        spawn_stage("receive", &argv, stdin, Stdio::null())
    }

    async fn list_snapshots(&self, _flush_cache: bool) -> Result<Vec<Snapshot>> {
        Ok(Vec::new())
    }

    async fn register_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }

    async fn lock_table(&self) -> Result<LockTable> {
        Ok(LockTable::new())
    }

    async fn set_lock(&self, _snapshot: &Snapshot, _lock_id: &str, _active: bool, _parent: bool) -> Result<()> {
        Ok(())
    }

    async fn clear_locks(&self, _lock_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn delete_snapshots(&self, _snapshots: &[Snapshot]) -> Result<Vec<Snapshot>> {
        Ok(Vec::new())
    }

    async fn get_space_info(&self) -> Result<SpaceInfo> {
        Err(AgentError::Unsupported(format!(
            "space information for shell target '{}'",
            self.command
        )))
    }
}
