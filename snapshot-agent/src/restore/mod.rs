//! Restoring snapshots from a backup endpoint.
//!
//! The inverse of a backup run: the backup endpoint sends, the target
//! receives. Every snapshot the restore needs is locked on the backup with a
//! `restore:<session>` id before the first transfer, so retention cannot
//! remove a link of the chain halfway through. The session locks are released
//! only when the whole chain arrived; on failure they stay for inspection.

use crate::endpoint::{Endpoint, SendEndpoint};
use crate::locks::restore_lock_id;
use crate::snapshot::{find_parent, sort_snapshots, Snapshot};
use crate::transfer::TransferEngine;
use crate::utils::errors::{AgentError, Result};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Restore every backup snapshot between the newest one the target
    /// already has and the requested one, so later incrementals have a base.
    /// Without it only the requested snapshot is sent.
    pub full_chain: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { full_chain: true }
    }
}

#[derive(Debug)]
pub struct RestoreReport {
    pub session_id: String,
    /// Restored snapshot names, oldest first.
    pub restored: Vec<String>,
}

/// Snapshots to send so that `wanted` ends up at the target, oldest first.
///
/// `backup` and `target` are ascending. The chain starts right after the
/// newest snapshot older than `wanted` that the target already has, or at the
/// oldest backup snapshot when the target has none of them.
pub fn restore_chain(
    backup: &[Snapshot],
    target: &[Snapshot],
    wanted: &Snapshot,
    full_chain: bool,
) -> Result<Vec<Snapshot>> {
    if target.contains(wanted) {
        return Ok(Vec::new());
    }
    if !full_chain {
        return Ok(vec![wanted.clone()]);
    }

    let mut chain = Vec::new();
    for snapshot in backup.iter().rev() {
        if snapshot.try_cmp(wanted)?.is_gt() {
            continue;
        }
        if target.contains(snapshot) {
            break;
        }
        chain.push(snapshot.clone());
    }
    chain.reverse();
    Ok(chain)
}

/// Restore the snapshot called `name` from `backup` to `target`.
pub async fn restore_snapshot(
    engine: &TransferEngine,
    backup: &dyn SendEndpoint,
    target: &dyn Endpoint,
    name: &str,
    options: RestoreOptions,
) -> Result<RestoreReport> {
    let backup_snapshots = backup.list_snapshots(true).await?;
    let wanted = backup_snapshots
        .iter()
        .find(|s| s.name() == name)
        .cloned()
        .ok_or_else(|| AgentError::Restore(format!("snapshot '{}' not found on {}", name, backup.id())))?;

    let mut present: Vec<Snapshot> = target
        .list_snapshots(true)
        .await?
        .into_iter()
        .filter(|s| backup_snapshots.contains(s))
        .collect();
    let chain = restore_chain(&backup_snapshots, &present, &wanted, options.full_chain)?;

    let session_id = Uuid::new_v4().to_string();
    let lock_id = restore_lock_id(&session_id);
    let mut report = RestoreReport {
        session_id,
        restored: Vec::new(),
    };
    if chain.is_empty() {
        info!(snapshot = %name, destination = %target.id(), "Snapshot already present, nothing to restore");
        return Ok(report);
    }

    info!(
        snapshot = %name,
        backup = %backup.id(),
        destination = %target.id(),
        chain = chain.len(),
        session = %lock_id,
        "Starting restore"
    );
    for snapshot in &chain {
        backup.set_lock(snapshot, &lock_id, true, false).await?;
    }
    if let Some(base) = find_parent(&chain[0], &present)? {
        backup.set_lock(&base, &lock_id, true, true).await?;
    }

    for snapshot in &chain {
        let parent = find_parent(snapshot, &present)?;
        if let Err(e) = engine.transfer(backup, target, snapshot, parent.as_ref()).await {
            error!(snapshot = %snapshot, session = %lock_id, "Restore failed, session locks kept: {}", e);
            return Err(AgentError::Restore(format!("failed to restore {}: {}", snapshot, e)));
        }
        target.register_snapshot(snapshot).await?;
        present.push(snapshot.clone());
        sort_snapshots(&mut present);
        report.restored.push(snapshot.name());
    }

    let released = backup.clear_locks(&lock_id).await?;
    info!(
        session = %lock_id,
        restored = report.restored.len(),
        released = released.len(),
        "Restore completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::test_support::{fake_btrfs, make_snapshot};
    use crate::endpoint::{LocalEndpoint, ShellEndpoint};
    use crate::snapshot::test_support::snap;
    use crate::transfer::TransferOptions;
    use tempfile::TempDir;

    fn quiet_engine() -> TransferEngine {
        TransferEngine::new(TransferOptions {
            progress: false,
            check_space: false,
            ..TransferOptions::default()
        })
    }

    #[test]
    fn test_chain_starts_after_common_snapshot() {
        let backup: Vec<Snapshot> = (1..=5).map(|m| snap("h-", m)).collect();
        let target = vec![backup[1].clone()];

        let chain = restore_chain(&backup, &target, &backup[3], true).unwrap();
        assert_eq!(chain, vec![backup[2].clone(), backup[3].clone()]);

        let single = restore_chain(&backup, &target, &backup[3], false).unwrap();
        assert_eq!(single, vec![backup[3].clone()]);
    }

    #[test]
    fn test_chain_from_scratch_and_when_present() {
        let backup: Vec<Snapshot> = (1..=3).map(|m| snap("h-", m)).collect();
        assert_eq!(restore_chain(&backup, &[], &backup[1], true).unwrap(), backup[..2].to_vec());
        assert!(restore_chain(&backup, &backup, &backup[2], true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_releases_session_locks() {
        let tmp = TempDir::new().unwrap();
        let btrfs = fake_btrfs(tmp.path()).to_string_lossy().into_owned();
        let backup = LocalEndpoint::new(tmp.path().join("backup"), "h-").with_btrfs_command(&btrfs);
        let target = LocalEndpoint::new(tmp.path().join("restore"), "h-").with_btrfs_command(&btrfs);
        let (a, b) = (snap("h-", 1), snap("h-", 2));
        make_snapshot(backup.dir(), &a.name(), b"first");
        make_snapshot(backup.dir(), &b.name(), b"second");

        let report = restore_snapshot(&quiet_engine(), &backup, &target, &b.name(), RestoreOptions::default())
            .await
            .unwrap();

        assert_eq!(report.restored, vec![a.name(), b.name()]);
        assert_eq!(std::fs::read(target.dir().join(b.name()).join("data")).unwrap(), b"second");
        assert!(backup.lock_table().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_session_locks() {
        let tmp = TempDir::new().unwrap();
        let btrfs = fake_btrfs(tmp.path()).to_string_lossy().into_owned();
        let backup = LocalEndpoint::new(tmp.path().join("backup"), "h-").with_btrfs_command(&btrfs);
        let a = snap("h-", 1);
        make_snapshot(backup.dir(), &a.name(), b"first");
        let target = ShellEndpoint::new("cat > /dev/null; exit 2", "h-");

        let err = restore_snapshot(&quiet_engine(), &backup, &target, &a.name(), RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Restore(_)));

        let table = backup.lock_table().await.unwrap();
        let holders: Vec<String> = table.lock_set(&a).locks.into_iter().collect();
        assert_eq!(holders.len(), 1);
        assert!(holders[0].starts_with("restore:"));
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_a_restore_error() {
        let tmp = TempDir::new().unwrap();
        let backup = LocalEndpoint::new(tmp.path().join("backup"), "h-");
        let target = LocalEndpoint::new(tmp.path().join("restore"), "h-");
        let err = restore_snapshot(&quiet_engine(), &backup, &target, "h-20990101-000000", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Restore(_)));
    }
}
