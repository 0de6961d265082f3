//! Snapshot lock sets and the lock table.
//!
//! A snapshot with any lock is never deleted. Direct locks are held by a
//! destination while the snapshot is being transferred to it (or after that
//! transfer failed); parent locks are held while the snapshot serves as the
//! incremental parent of a pending transfer. Lock IDs are either a stable
//! destination identity or a `restore:<session>` token.
//!
//! The table lives apart from [`Snapshot`] values and is keyed by snapshot
//! name. Persisted form:
//!
//! ```json
//! { "home-20240101-120000": { "locks": ["ssh://backup/mnt"], "parent_locks": [] } }
//! ```

pub mod store;

use crate::snapshot::Snapshot;
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use store::{LocalLockFile, LockStore};

/// Lock ID used by restore and verify sessions.
pub fn restore_lock_id(session_id: &str) -> String {
    format!("restore:{}", session_id)
}

/// Holds on one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSet {
    #[serde(default)]
    pub locks: BTreeSet<String>,
    #[serde(default)]
    pub parent_locks: BTreeSet<String>,
}

impl LockSet {
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty() && self.parent_locks.is_empty()
    }

    /// True if `lock_id` holds a direct lock.
    pub fn has_lock(&self, lock_id: &str) -> bool {
        self.locks.contains(lock_id)
    }

    pub fn has_parent_lock(&self, lock_id: &str) -> bool {
        self.parent_locks.contains(lock_id)
    }
}

/// A single change to the lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockMutation {
    Set {
        snapshot: String,
        lock_id: String,
        active: bool,
        parent: bool,
    },
    /// Release every lock held by an ID (operator unlock).
    ClearId { lock_id: String },
    /// Release every lock on one snapshot.
    ClearSnapshot { snapshot: String },
}

impl LockMutation {
    pub fn set(snapshot: &Snapshot, lock_id: &str, active: bool, parent: bool) -> Self {
        LockMutation::Set {
            snapshot: snapshot.name(),
            lock_id: lock_id.to_string(),
            active,
            parent,
        }
    }
}

/// Lock sets of every snapshot in one snapshot directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockTable {
    entries: BTreeMap<String, LockSet>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the persisted form. Blank content is an empty table; anything
    /// else that is not valid lock JSON is an error, never "unlocked".
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        let entries: BTreeMap<String, LockSet> = serde_json::from_str(content)
            .map_err(|e| AgentError::LockFile(format!("malformed lock file: {}", e)))?;
        let mut table = Self { entries };
        table.prune();
        Ok(table)
    }

    /// Pretty-printed JSON of every non-empty lock set.
    pub fn to_json(&self) -> Result<String> {
        let live: BTreeMap<&String, &LockSet> =
            self.entries.iter().filter(|(_, set)| !set.is_empty()).collect();
        Ok(serde_json::to_string_pretty(&live)?)
    }

    pub fn get(&self, snapshot_name: &str) -> LockSet {
        self.entries.get(snapshot_name).cloned().unwrap_or_default()
    }

    pub fn lock_set(&self, snapshot: &Snapshot) -> LockSet {
        self.get(&snapshot.name())
    }

    pub fn is_locked(&self, snapshot: &Snapshot) -> bool {
        self.entries
            .get(&snapshot.name())
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn set_lock(&mut self, snapshot_name: &str, lock_id: &str, active: bool, parent: bool) {
        let set = self.entries.entry(snapshot_name.to_string()).or_default();
        let target = if parent { &mut set.parent_locks } else { &mut set.locks };
        if active {
            target.insert(lock_id.to_string());
        } else {
            target.remove(lock_id);
        }
        self.prune();
    }

    /// Remove every lock held by `lock_id`. Returns the affected snapshot names.
    pub fn clear_id(&mut self, lock_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for (name, set) in self.entries.iter_mut() {
            let removed_direct = set.locks.remove(lock_id);
            let removed_parent = set.parent_locks.remove(lock_id);
            if removed_direct || removed_parent {
                affected.push(name.clone());
            }
        }
        self.prune();
        affected
    }

    pub fn apply(&mut self, mutation: &LockMutation) {
        match mutation {
            LockMutation::Set {
                snapshot,
                lock_id,
                active,
                parent,
            } => self.set_lock(snapshot, lock_id, *active, *parent),
            LockMutation::ClearId { lock_id } => {
                self.clear_id(lock_id);
            }
            LockMutation::ClearSnapshot { snapshot } => {
                self.entries.remove(snapshot);
            }
        }
    }

    /// Names of snapshots on which `lock_id` holds any lock.
    pub fn held_by(&self, lock_id: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, set)| set.has_lock(lock_id) || set.has_parent_lock(lock_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        self.entries.retain(|_, set| !set.is_empty());
    }
}

/// Pick the snapshots retention may delete: unlocked ones only, oldest first,
/// leaving the newest `keep` unlocked snapshots. `keep == 0` retains everything.
///
/// `snapshots` must be in ascending time order.
pub fn select_for_deletion(snapshots: &[Snapshot], table: &LockTable, keep: usize) -> Vec<Snapshot> {
    if keep == 0 {
        return Vec::new();
    }

    let unlocked: Vec<&Snapshot> = snapshots.iter().filter(|s| !table.is_locked(s)).collect();
    let excess = unlocked.len().saturating_sub(keep);
    unlocked.into_iter().take(excess).cloned().collect()
}
