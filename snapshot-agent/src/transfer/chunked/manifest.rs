//! Persisted record of one chunked transfer.
//!
//! The manifest is the only input to resume decisions. Status moves
//! `pending -> chunking -> transferring -> completed | failed`; a failed
//! transfer can be picked up again and moves back to `transferring`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Chunking,
    Transferring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Transferred,
    Failed,
}

/// One slice of the send stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub sequence: u32,
    pub size: u64,
    /// Lowercase hex SHA-256 of the raw chunk bytes.
    pub checksum: String,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkMeta {
    pub fn new(sequence: u32, data: &[u8]) -> Self {
        Self {
            sequence,
            size: data.len() as u64,
            checksum: checksum(data),
            status: ChunkStatus::Pending,
            error: None,
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && checksum(data) == self.checksum
    }
}

/// Hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    pub transfer_id: String,
    pub snapshot_name: String,
    pub destination: String,
    pub parent_name: Option<String>,
    pub chunk_count: u32,
    pub total_size: u64,
    pub status: TransferStatus,
    /// Set once the send stream has ended; the chunk list is frozen from then on.
    #[serde(default)]
    pub chunking_complete: bool,
    pub chunks: Vec<ChunkMeta>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferManifest {
    pub fn new(snapshot_name: &str, destination: &str, parent_name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: Uuid::new_v4().to_string(),
            snapshot_name: snapshot_name.to_string(),
            destination: destination.to_string(),
            parent_name: parent_name.map(str::to_string),
            chunk_count: 0,
            total_size: 0,
            status: TransferStatus::Pending,
            chunking_complete: false,
            chunks: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same snapshot, destination and parent.
    pub fn describes(&self, snapshot_name: &str, destination: &str, parent_name: Option<&str>) -> bool {
        self.snapshot_name == snapshot_name
            && self.destination == destination
            && self.parent_name.as_deref() == parent_name
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransferStatus::Completed
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
        self.touch();
    }

    /// Drop all chunks and start chunking from scratch.
    pub fn reset_chunks(&mut self) {
        self.chunks.clear();
        self.chunk_count = 0;
        self.total_size = 0;
        self.chunking_complete = false;
        self.set_status(TransferStatus::Chunking);
    }

    /// Append the next chunk. Returns its sequence number.
    pub fn push_chunk(&mut self, data: &[u8]) -> ChunkMeta {
        let meta = ChunkMeta::new(self.chunk_count, data);
        self.chunk_count += 1;
        self.total_size += meta.size;
        self.chunks.push(meta.clone());
        self.touch();
        meta
    }

    pub fn freeze_chunks(&mut self) {
        self.chunking_complete = true;
        self.touch();
    }

    pub fn chunk(&self, sequence: u32) -> Option<&ChunkMeta> {
        self.chunks.iter().find(|c| c.sequence == sequence)
    }

    /// Chunks not yet transferred, in sequence order.
    pub fn pending_chunks(&self) -> Vec<ChunkMeta> {
        let mut pending: Vec<ChunkMeta> = self
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Transferred)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.sequence);
        pending
    }

    /// Lowest sequence number still to be sent.
    pub fn resume_point(&self) -> Option<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Transferred)
            .map(|c| c.sequence)
            .min()
    }

    pub fn transferred_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Transferred)
            .count()
    }

    pub fn mark_transferred(&mut self, sequence: u32) {
        if let Some(chunk) = self.chunks.iter_mut().find(|c| c.sequence == sequence) {
            chunk.status = ChunkStatus::Transferred;
            chunk.error = None;
        }
        self.touch();
    }

    /// Put transferred chunks back to pending, e.g. when the `receive` that
    /// took them did not accept the stream.
    pub fn reopen_chunks(&mut self, sequences: &[u32]) {
        for chunk in self.chunks.iter_mut() {
            if sequences.contains(&chunk.sequence) && chunk.status == ChunkStatus::Transferred {
                chunk.status = ChunkStatus::Pending;
            }
        }
        self.touch();
    }

    pub fn mark_chunk_failed(&mut self, sequence: u32, error: &str) {
        if let Some(chunk) = self.chunks.iter_mut().find(|c| c.sequence == sequence) {
            chunk.status = ChunkStatus::Failed;
            chunk.error = Some(error.to_string());
        }
        self.touch();
    }

    pub fn fail(&mut self, reason: &str) {
        self.error_message = Some(reason.to_string());
        self.set_status(TransferStatus::Failed);
    }

    pub fn complete(&mut self) {
        self.error_message = None;
        self.set_status(TransferStatus::Completed);
    }
}
