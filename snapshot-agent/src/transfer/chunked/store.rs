//! On-disk staging area for chunked transfers.
//!
//! ```text
//! <root>/<transferId>/manifest.json
//! <root>/<transferId>/chunk-000042.zst
//! ```

use super::manifest::TransferManifest;
use crate::utils::errors::{AgentError, Result};
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transfer_dir(&self, transfer_id: &str) -> PathBuf {
        self.root.join(transfer_id)
    }

    fn manifest_path(&self, transfer_id: &str) -> PathBuf {
        self.transfer_dir(transfer_id).join(MANIFEST_FILE)
    }

    pub fn chunk_path(&self, transfer_id: &str, sequence: u32) -> PathBuf {
        self.transfer_dir(transfer_id)
            .join(format!("chunk-{:06}.zst", sequence))
    }

    /// Write the manifest atomically.
    pub async fn save(&self, manifest: &TransferManifest) -> Result<()> {
        let dir = self.transfer_dir(&manifest.transfer_id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        let json = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, transfer_id: &str) -> Result<TransferManifest> {
        let path = self.manifest_path(transfer_id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AgentError::Abort(format!("unknown transfer '{}'", transfer_id)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    /// Every readable manifest under the root. Unreadable ones are skipped.
    pub async fn list(&self) -> Result<Vec<TransferManifest>> {
        let mut manifests = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(transfer = %id, "Skipping unreadable manifest: {}", e),
            }
        }
        manifests.sort_by_key(|m| m.created_at);
        Ok(manifests)
    }

    pub async fn write_chunk(&self, transfer_id: &str, sequence: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(transfer_id, sequence);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let file = fs::File::create(&path).await?;
        let mut encoder = ZstdEncoder::new(file);
        encoder.write_all(data).await?;
        encoder.shutdown().await?;
        Ok(())
    }

    pub async fn read_chunk(&self, transfer_id: &str, sequence: u32) -> Result<Vec<u8>> {
        let path = self.chunk_path(transfer_id, sequence);
        let file = fs::File::open(&path).await.map_err(|e| {
            AgentError::Abort(format!("chunk {} of transfer {} is unavailable: {}", sequence, transfer_id, e))
        })?;
        let mut decoder = ZstdDecoder::new(BufReader::new(file));
        let mut data = Vec::new();
        decoder.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Delete the staged chunks and manifest of one transfer.
    pub async fn remove(&self, transfer_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.transfer_dir(transfer_id)).await {
            Ok(()) => {
                debug!(transfer = %transfer_id, "Removed chunk staging directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
