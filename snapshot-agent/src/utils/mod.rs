//! Utility modules for the snapshot agent.

pub mod errors;
pub mod logger;
pub mod shell;
pub mod shutdown;

pub use errors::{AgentError, Result, SnapshotTransferError, StageFailure};
