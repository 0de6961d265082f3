//! Deciding what to send to a destination, and in which order.
//!
//! [`plan`] finds the snapshots a destination is missing. [`select_next`]
//! picks the candidate with the closest usable parent, so the chain is built
//! from its cheapest link outward instead of strictly by age. [`Planner::sync`]
//! runs the loop: lock, transfer, unlock and register, one pair at a time.
//!
//! Locks are taken on the source with the destination's id as lock id. A
//! failed transfer keeps its locks, so neither the snapshot nor its parent can
//! be removed by retention until a later run succeeds or an operator unlocks.

use crate::endpoint::{Endpoint, SendEndpoint};
use crate::locks::LockTable;
use crate::snapshot::{find_parent, sort_snapshots, Snapshot};
use crate::transfer::TransferEngine;
use crate::utils::errors::{AgentError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Snapshots of `source` that `destination` is missing, in source order.
///
/// With `keep > 0` only the newest `keep` source snapshots are considered.
pub fn plan(source: &[Snapshot], destination: &[Snapshot], keep: usize) -> Vec<Snapshot> {
    let pool = if keep > 0 && keep < source.len() {
        &source[source.len() - keep..]
    } else {
        source
    };
    pool.iter()
        .filter(|s| !destination.contains(s))
        .cloned()
        .collect()
}

/// Snapshots usable as incremental parents: present on both sides and not
/// directly locked by `destination_id`. A snapshot still locked by this
/// destination is mid-transfer or failed there, so it is not trusted.
pub fn usable_parents(
    source: &[Snapshot],
    destination: &[Snapshot],
    table: &LockTable,
    destination_id: &str,
) -> Vec<Snapshot> {
    source
        .iter()
        .filter(|s| destination.contains(s))
        .filter(|s| !table.lock_set(s).has_lock(destination_id))
        .cloned()
        .collect()
}

/// Pick the next candidate. Returns its index in `candidates` and its parent.
///
/// In full mode this is the newest candidate with no parent. Otherwise it is
/// the candidate whose parent is closest in the source ordering; candidates
/// without any parent come last and ties keep candidate order.
pub fn select_next(
    candidates: &[Snapshot],
    source: &[Snapshot],
    present: &[Snapshot],
    no_incremental: bool,
) -> Result<Option<(usize, Option<Snapshot>)>> {
    if candidates.is_empty() {
        return Ok(None);
    }
    if no_incremental {
        let mut newest = 0;
        for (i, candidate) in candidates.iter().enumerate().skip(1) {
            if candidates[newest].is_older_than(candidate)? {
                newest = i;
            }
        }
        return Ok(Some((newest, None)));
    }

    let index_of = |s: &Snapshot| source.iter().position(|x| x == s);
    let mut best: Option<(usize, Option<Snapshot>, usize)> = None;

    for (i, candidate) in candidates.iter().enumerate() {
        let parent = find_parent(candidate, present)?;
        let distance = match (&parent, index_of(candidate)) {
            (Some(p), Some(ci)) => index_of(p).map(|pi| ci.abs_diff(pi)).unwrap_or(usize::MAX),
            _ => usize::MAX,
        };
        if best.as_ref().map_or(true, |(_, _, d)| distance < *d) {
            best = Some((i, parent, distance));
        }
    }

    Ok(best.map(|(i, parent, _)| (i, parent)))
}

/// What one sync run did for one destination.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub transferred: Vec<String>,
    /// Snapshots whose transfer failed; their locks are kept.
    pub failed: Vec<String>,
    /// Set when the run stopped early, e.g. for lack of space.
    pub stopped: Option<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.stopped.is_none()
    }
}

pub struct Planner<'a> {
    engine: &'a TransferEngine,
    no_incremental: bool,
    keep: usize,
    cancel: CancellationToken,
}

impl<'a> Planner<'a> {
    pub fn new(engine: &'a TransferEngine) -> Self {
        Self {
            engine,
            no_incremental: false,
            keep: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Always send full streams.
    pub fn no_incremental(mut self, no_incremental: bool) -> Self {
        self.no_incremental = no_incremental;
        self
    }

    /// Only consider the newest `keep` source snapshots (0 = all).
    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    /// Stop between transfers once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bring `destination` up to date with `source`.
    ///
    /// A failed snapshot is logged and skipped. Running out of space stops
    /// this destination after releasing the pair's locks. Any other error is
    /// returned with the locks left in place.
    pub async fn sync(&self, source: &dyn SendEndpoint, destination: &dyn Endpoint) -> Result<SyncReport> {
        let destination_id = destination.id();
        let source_snapshots = source.list_snapshots(true).await?;
        let mut present = destination.list_snapshots(true).await?;
        let mut candidates = plan(&source_snapshots, &present, self.keep);
        let mut report = SyncReport::default();

        info!(
            destination = %destination_id,
            candidates = candidates.len(),
            present = present.len(),
            "Planned transfers"
        );

        while !candidates.is_empty() {
            if self.cancel.is_cancelled() {
                report.stopped = Some("cancelled".into());
                break;
            }

            let table = source.lock_table().await?;
            let parents = usable_parents(&source_snapshots, &present, &table, &destination_id);
            let Some((index, parent)) = select_next(&candidates, &source_snapshots, &parents, self.no_incremental)?
            else {
                break;
            };
            let snapshot = candidates.remove(index);

            source.set_lock(&snapshot, &destination_id, true, false).await?;
            if let Some(parent) = &parent {
                source.set_lock(parent, &destination_id, true, true).await?;
            }

            match self.engine.transfer(source, destination, &snapshot, parent.as_ref()).await {
                Ok(_) => {
                    self.release(source, &snapshot, parent.as_ref(), &destination_id).await?;
                    destination.register_snapshot(&snapshot).await?;
                    present.push(snapshot.clone());
                    sort_snapshots(&mut present);
                    report.transferred.push(snapshot.name());
                }
                Err(e) if e.is_transfer_failure() => {
                    error!(
                        snapshot = %snapshot,
                        destination = %destination_id,
                        "Transfer failed, keeping locks until resolved: {}",
                        e
                    );
                    report.failed.push(snapshot.name());
                }
                Err(e @ AgentError::InsufficientSpace { .. }) => {
                    warn!(destination = %destination_id, "Stopping transfers: {}", e);
                    self.release(source, &snapshot, parent.as_ref(), &destination_id).await?;
                    report.stopped = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            destination = %destination_id,
            transferred = report.transferred.len(),
            failed = report.failed.len(),
            "Sync finished"
        );
        Ok(report)
    }

    async fn release(
        &self,
        source: &dyn SendEndpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        lock_id: &str,
    ) -> Result<()> {
        source.set_lock(snapshot, lock_id, false, false).await?;
        if let Some(parent) = parent {
            source.set_lock(parent, lock_id, false, true).await?;
        }
        Ok(())
    }
}
