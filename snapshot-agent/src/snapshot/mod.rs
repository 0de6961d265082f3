//! Snapshot values and their ordering.
//!
//! A snapshot is identified by its prefix and timestamp. The directory it lives
//! in is carried along for building paths but takes no part in identity, so the
//! same snapshot on a source and on a destination compares equal.
//!
//! Ordering is only defined between snapshots that share a prefix. Comparing
//! snapshots of different subvolumes is a programming error and is reported as
//! [`AgentError::Snapshot`] instead of quietly answering "not older".

pub mod catalog;

use crate::utils::errors::{AgentError, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

pub use catalog::{find_parent, SnapshotCatalog};

/// Timestamp suffix appended to the prefix to form a snapshot name.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Identity of a snapshot, independent of where it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub prefix: String,
    pub timestamp: NaiveDateTime,
}

impl SnapshotKey {
    pub fn name(&self) -> String {
        format!("{}{}", self.prefix, self.timestamp.format(TIMESTAMP_FORMAT))
    }
}

/// An immutable, read-only, point-in-time copy of a subvolume.
#[derive(Debug, Clone)]
pub struct Snapshot {
    location: PathBuf,
    key: SnapshotKey,
}

impl Snapshot {
    /// Build a snapshot value. Sub-second precision is dropped because the
    /// name format cannot represent it.
    pub fn new(location: impl Into<PathBuf>, prefix: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        Self {
            location: location.into(),
            key: SnapshotKey {
                prefix: prefix.into(),
                timestamp,
            },
        }
    }

    /// A snapshot stamped with the current local time.
    pub fn now(location: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self::new(location, prefix, Local::now().naive_local())
    }

    /// Reconstruct a snapshot from its directory entry name.
    pub fn parse(location: impl Into<PathBuf>, prefix: &str, name: &str) -> Result<Self> {
        let suffix = name.strip_prefix(prefix).ok_or_else(|| {
            AgentError::Snapshot(format!("'{}' does not start with prefix '{}'", name, prefix))
        })?;
        let timestamp = NaiveDateTime::parse_from_str(suffix, TIMESTAMP_FORMAT).map_err(|e| {
            AgentError::Snapshot(format!("'{}' has no valid timestamp suffix: {}", name, e))
        })?;
        Ok(Self::new(location, prefix, timestamp))
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn prefix(&self) -> &str {
        &self.key.prefix
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.key.timestamp
    }

    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub fn name(&self) -> String {
        self.key.name()
    }

    /// Full path of the snapshot subvolume.
    pub fn path(&self) -> PathBuf {
        self.location.join(self.name())
    }

    /// The same snapshot as seen from another directory.
    pub fn relocated(&self, location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            key: self.key.clone(),
        }
    }

    /// Compare two snapshots of the same subvolume by time.
    pub fn try_cmp(&self, other: &Snapshot) -> Result<Ordering> {
        if self.key.prefix != other.key.prefix {
            return Err(AgentError::Snapshot(format!(
                "cannot order snapshots with different prefixes: '{}' vs '{}'",
                self.name(),
                other.name()
            )));
        }
        Ok(self.key.timestamp.cmp(&other.key.timestamp))
    }

    pub fn is_older_than(&self, other: &Snapshot) -> Result<bool> {
        Ok(self.try_cmp(other)? == Ordering::Less)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Snapshot {}

impl Hash for Snapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Sort snapshots of one prefix in ascending time order.
pub fn sort_snapshots(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| a.key.timestamp.cmp(&b.key.timestamp));
}
