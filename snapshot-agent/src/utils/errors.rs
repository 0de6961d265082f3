//! Custom error types for the snapshot agent.

use std::fmt;
use thiserror::Error;

/// Maximum number of stderr bytes kept per failed stage.
const STDERR_EXCERPT_LEN: usize = 2048;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The current task must stop entirely.
    #[error("Aborted: {0}")]
    Abort(String),

    /// One snapshot transfer failed. Its locks are kept so a later run can retry.
    #[error(transparent)]
    SnapshotTransfer(#[from] SnapshotTransferError),

    #[error("Insufficient space on {destination}: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        destination: String,
        required: u64,
        available: u64,
    },

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("Verification error: {0}")]
    Verify(String),

    #[error("Lock file error: {0}")]
    LockFile(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// An auxiliary command (listing, deletion, space query) failed.
    #[error("Command failed: {0}")]
    Command(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// True for failures scoped to a single snapshot. The planner logs these
    /// and moves on to the next candidate; everything else stops the run.
    pub fn is_transfer_failure(&self) -> bool {
        matches!(self, AgentError::SnapshotTransfer(_))
    }
}

/// Exit information for one pipeline stage that did not succeed.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
}

impl StageFailure {
    pub fn new(command: impl Into<String>, exit_code: Option<i32>, stderr: &str) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stderr: excerpt(stderr),
            timed_out: false,
        }
    }

    pub fn timeout(command: impl Into<String>, stderr: &str) -> Self {
        Self {
            timed_out: true,
            ..Self::new(command, None, stderr)
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "`{}` timed out", self.command)?;
        } else {
            match self.exit_code {
                Some(code) => write!(f, "`{}` exited with code {}", self.command, code)?,
                None => write!(f, "`{}` was terminated by a signal", self.command)?,
            }
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

/// A failed transfer of one snapshot, with enough context to diagnose it
/// without re-running.
#[derive(Debug, Clone)]
pub struct SnapshotTransferError {
    pub snapshot: String,
    pub message: String,
    pub stages: Vec<StageFailure>,
    /// Sequence number of the failing chunk for chunked transfers.
    pub chunk: Option<u32>,
}

impl SnapshotTransferError {
    pub fn new(snapshot: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            snapshot: snapshot.into(),
            message: message.into(),
            stages: Vec::new(),
            chunk: None,
        }
    }

    pub fn with_stages(mut self, stages: Vec<StageFailure>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_chunk(mut self, sequence: u32) -> Self {
        self.chunk = Some(sequence);
        self
    }
}

impl fmt::Display for SnapshotTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer of {} failed: {}", self.snapshot, self.message)?;
        if let Some(seq) = self.chunk {
            write!(f, " (chunk {})", seq)?;
        }
        for stage in &self.stages {
            write!(f, "; {}", stage)?;
        }
        Ok(())
    }
}

impl std::error::Error for SnapshotTransferError {}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &trimmed[cut..])
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display_includes_stage_context() {
        let err = SnapshotTransferError::new("home-20240101-120000", "pipeline failed")
            .with_stages(vec![StageFailure::new("btrfs receive /mnt", Some(1), "ERROR: no space\n")]);

        let text = err.to_string();
        assert!(text.contains("home-20240101-120000"));
        assert!(text.contains("exited with code 1"));
        assert!(text.contains("ERROR: no space"));
    }

    #[test]
    fn test_transfer_error_records_chunk() {
        let err = SnapshotTransferError::new("s", "write failed").with_chunk(6);
        assert_eq!(err.chunk, Some(6));
        assert!(err.to_string().contains("chunk 6"));
    }

    #[test]
    fn test_stderr_excerpt_keeps_tail() {
        let long = "x".repeat(5000) + "tail";
        let failure = StageFailure::new("cmd", Some(2), &long);
        assert!(failure.stderr.ends_with("tail"));
        assert!(failure.stderr.len() <= STDERR_EXCERPT_LEN + 3);
    }

    #[test]
    fn test_is_transfer_failure() {
        let transfer: AgentError = SnapshotTransferError::new("s", "boom").into();
        assert!(transfer.is_transfer_failure());
        assert!(!AgentError::Abort("stop".into()).is_transfer_failure());
    }
}
