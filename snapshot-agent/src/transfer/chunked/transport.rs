//! Where chunk bytes go once they leave the staging area.

use super::manifest::ChunkMeta;
use crate::endpoint::SpawnedProcess;
use crate::transfer::pipeline::RunningStage;
use crate::utils::errors::{AgentError, Result, SnapshotTransferError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

/// Sink for the reassembled stream. Chunks arrive in sequence order.
#[async_trait]
pub trait ChunkTransport: Send {
    async fn write_chunk(&mut self, chunk: &ChunkMeta, data: &[u8]) -> Result<()>;

    /// Close the stream and wait until the destination has accepted it.
    async fn finish(&mut self) -> Result<()>;
}

/// Feeds a live `receive` process.
pub struct ReceiveTransport {
    snapshot: String,
    stage: RunningStage,
    stdin: Option<ChildStdin>,
    receive_timeout: Duration,
}

impl ReceiveTransport {
    /// `process` must have been spawned with a piped stdin.
    pub fn new(snapshot: &str, process: SpawnedProcess, receive_timeout: Duration) -> Result<Self> {
        let mut stage = RunningStage::new(process);
        let stdin = stage
            .take_stdin()
            .ok_or_else(|| AgentError::Command(format!("stage '{}' has no stdin", stage.label())))?;
        Ok(Self {
            snapshot: snapshot.to_string(),
            stage,
            stdin: Some(stdin),
            receive_timeout,
        })
    }
}

#[async_trait]
impl ChunkTransport for ReceiveTransport {
    async fn write_chunk(&mut self, chunk: &ChunkMeta, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            AgentError::from(SnapshotTransferError::new(&self.snapshot, "receive stream already closed"))
        })?;
        stdin.write_all(data).await.map_err(|e| {
            AgentError::from(
                SnapshotTransferError::new(&self.snapshot, format!("failed to write chunk: {}", e))
                    .with_chunk(chunk.sequence),
            )
        })
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // A receive that already exited shows up in its exit status below.
            let _ = stdin.shutdown().await;
        }
        match self.stage.wait(self.receive_timeout).await {
            None => Ok(()),
            Some(failure) => Err(SnapshotTransferError::new(&self.snapshot, "receive did not accept the stream")
                .with_stages(vec![failure])
                .into()),
        }
    }
}
