//! Append-only transaction log, one JSON object per line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub status: TransactionStatus,
    pub source: String,
    pub destination: String,
    pub snapshot: String,
    pub parent: Option<String>,
    pub duration_seconds: Option<f64>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
}

impl TransactionRecord {
    pub fn new(action: &str, status: TransactionStatus, source: &str, destination: &str, snapshot: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            status,
            source: source.to_string(),
            destination: destination.to_string(),
            snapshot: snapshot.to_string(),
            parent: None,
            duration_seconds: None,
            size_bytes: None,
            error: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_size(mut self, bytes: Option<u64>) -> Self {
        self.size_bytes = bytes;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Transaction sink. Every record also goes to the tracing log; the file is
/// optional. A log write failure never fails the transfer it describes.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    path: Option<PathBuf>,
}

impl TransactionLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn record(&self, record: &TransactionRecord) {
        match record.status {
            TransactionStatus::Failed => warn!(
                action = %record.action,
                snapshot = %record.snapshot,
                destination = %record.destination,
                "Transaction failed: {}",
                record.error.as_deref().unwrap_or("unknown error")
            ),
            status => info!(
                action = %record.action,
                snapshot = %record.snapshot,
                destination = %record.destination,
                parent = record.parent.as_deref().unwrap_or("-"),
                "Transaction {:?}",
                status
            ),
        }

        if let Some(path) = &self.path {
            if let Err(e) = Self::append(path, record).await {
                warn!(path = %path.display(), "Failed to write transaction log: {}", e);
            }
        }
    }

    async fn append(path: &Path, record: &TransactionRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/transactions.jsonl");
        let log = TransactionLog::new(Some(path.clone()));

        log.record(&TransactionRecord::new("transfer", TransactionStatus::Started, "src", "dst", "h-1"))
            .await;
        log.record(
            &TransactionRecord::new("transfer", TransactionStatus::Failed, "src", "dst", "h-1")
                .with_parent(Some("h-0".into()))
                .with_duration(1.5)
                .with_error("receive exited with code 1"),
        )
        .await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "started");
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[1]["parent"], "h-0");
        assert_eq!(lines[1]["durationSeconds"], 1.5);
        assert!(lines[1]["sizeBytes"].is_null());
        assert_eq!(lines[1]["error"], "receive exited with code 1");
    }

    #[tokio::test]
    async fn test_disabled_log_writes_nothing() {
        let log = TransactionLog::disabled();
        log.record(&TransactionRecord::new("transfer", TransactionStatus::Completed, "a", "b", "c"))
            .await;
        assert!(log.path().is_none());
    }
}
