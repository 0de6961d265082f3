//! Snapshot Agent Library
//!
//! Incremental btrfs snapshot backups: snapshot catalog, cross-destination
//! lock table, transfer planning, process-pipeline and resumable chunked
//! transfers, retention and restore.

pub mod config;
pub mod endpoint;
pub mod executor;
pub mod locks;
pub mod planner;
pub mod restore;
pub mod snapshot;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use snapshot::Snapshot;
pub use utils::errors::{AgentError, Result};
