//! Ordered, cached snapshot listings for one endpoint.

use super::{sort_snapshots, Snapshot};
use crate::utils::errors::{AgentError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Owns the ordered snapshot list of one endpoint.
///
/// The list is fetched lazily and cached. `add` keeps an existing cache in
/// sync; deletions and lock changes drop it so the next listing is fresh.
pub struct SnapshotCatalog {
    location: PathBuf,
    prefix: String,
    cache: Mutex<Option<Vec<Snapshot>>>,
}

impl SnapshotCatalog {
    pub fn new(location: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            prefix: prefix.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Turn directory entry names into ordered snapshots. Entries without the
    /// prefix are ignored; entries with the prefix but an unreadable timestamp
    /// are skipped with a warning.
    pub fn parse_listing<I, S>(&self, names: I) -> Vec<Snapshot>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshots: Vec<Snapshot> = names
            .into_iter()
            .filter_map(|name| {
                let name: &str = name.as_ref();
                if !name.starts_with(&self.prefix) {
                    return None;
                }
                match Snapshot::parse(&self.location, &self.prefix, name) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(location = %self.location.display(), "Skipping snapshot entry: {}", e);
                        None
                    }
                }
            })
            .collect();
        sort_snapshots(&mut snapshots);
        snapshots.dedup();
        snapshots
    }

    /// Return the cached list, or fetch and parse a fresh listing.
    pub async fn list_with<F, Fut>(&self, flush_cache: bool, fetch: F) -> Result<Vec<Snapshot>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let mut cache = self.cache.lock().await;
        if !flush_cache {
            if let Some(list) = cache.as_ref() {
                return Ok(list.clone());
            }
        }

        let names = fetch().await?;
        let snapshots = self.parse_listing(names);
        debug!(
            location = %self.location.display(),
            count = snapshots.len(),
            "Refreshed snapshot listing"
        );
        *cache = Some(snapshots.clone());
        Ok(snapshots)
    }

    /// Register a newly created or received snapshot. Does nothing until the
    /// catalog has been listed once.
    pub async fn add(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.prefix() != self.prefix {
            return Err(AgentError::Snapshot(format!(
                "snapshot '{}' does not belong to catalog with prefix '{}'",
                snapshot, self.prefix
            )));
        }

        let mut cache = self.cache.lock().await;
        let Some(list) = cache.as_mut() else {
            return Ok(());
        };
        if list.contains(snapshot) {
            return Ok(());
        }

        let snapshot = snapshot.relocated(&self.location);
        let pos = list.partition_point(|s| s.timestamp() < snapshot.timestamp());
        list.insert(pos, snapshot);
        Ok(())
    }

    /// Drop the cached listing.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    pub async fn is_cached(&self) -> bool {
        self.cache.lock().await.is_some()
    }
}

/// Choose the incremental parent for `candidate` among the snapshots already
/// present at the destination (`present`, ascending by time).
///
/// Returns `None` if the candidate is already present or nothing is present.
/// Otherwise returns the nearest strictly older snapshot, or the oldest one
/// when every present snapshot is newer than the candidate.
pub fn find_parent(candidate: &Snapshot, present: &[Snapshot]) -> Result<Option<Snapshot>> {
    if present.is_empty() || present.contains(candidate) {
        return Ok(None);
    }

    for snapshot in present.iter().rev() {
        if snapshot.is_older_than(candidate)? {
            return Ok(Some(snapshot.clone()));
        }
    }

    Ok(present.first().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_support::snap;

    #[test]
    fn test_parse_listing_filters_and_orders() {
        let catalog = SnapshotCatalog::new("/snapshots", "home-");
        let names = vec![
            "home-20240101-000300",
            "root-20240101-000100",
            "home-not-a-date",
            "home-20240101-000100",
            ".outstanding_transfers",
        ];

        let list = catalog.parse_listing(names);
        assert_eq!(list, vec![snap("home-", 1), snap("home-", 3)]);
    }

    #[tokio::test]
    async fn test_list_is_cached_until_flushed() {
        let catalog = SnapshotCatalog::new("/snapshots", "home-");

        let first = catalog
            .list_with(false, || async { Ok(vec!["home-20240101-000100".to_string()]) })
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let cached = catalog
            .list_with(false, || async { Err(AgentError::Abort("listing should come from cache".into())) })
            .await
            .unwrap();
        assert_eq!(cached, first);

        let flushed = catalog
            .list_with(true, || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert!(flushed.is_empty());
    }

    #[tokio::test]
    async fn test_add_keeps_order() {
        let catalog = SnapshotCatalog::new("/snapshots", "home-");
        catalog
            .list_with(false, || async {
                Ok(vec![
                    "home-20240101-000100".to_string(),
                    "home-20240101-000500".to_string(),
                ])
            })
            .await
            .unwrap();

        catalog.add(&snap("home-", 3)).await.unwrap();
        catalog.add(&snap("home-", 3)).await.unwrap();

        let list = catalog
            .list_with(false, || async { Err(AgentError::Abort("listing should come from cache".into())) })
            .await
            .unwrap();
        assert_eq!(list, vec![snap("home-", 1), snap("home-", 3), snap("home-", 5)]);
    }

    #[tokio::test]
    async fn test_add_is_lazy_and_checks_prefix() {
        let catalog = SnapshotCatalog::new("/snapshots", "home-");
        catalog.add(&snap("home-", 1)).await.unwrap();
        assert!(!catalog.is_cached().await);

        assert!(catalog.add(&snap("root-", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let catalog = SnapshotCatalog::new("/snapshots", "home-");
        catalog.list_with(false, || async { Ok(Vec::new()) }).await.unwrap();
        assert!(catalog.is_cached().await);
        catalog.invalidate().await;
        assert!(!catalog.is_cached().await);
    }

    #[test]
    fn test_find_parent_nearest_older() {
        let present = vec![snap("h-", 1), snap("h-", 3), snap("h-", 5)];
        let parent = find_parent(&snap("h-", 4), &present).unwrap();
        assert_eq!(parent, Some(snap("h-", 3)));
    }

    #[test]
    fn test_find_parent_already_present() {
        let present = vec![snap("h-", 1), snap("h-", 3)];
        assert_eq!(find_parent(&snap("h-", 3), &present).unwrap(), None);
    }

    #[test]
    fn test_find_parent_falls_back_to_oldest() {
        let present = vec![snap("h-", 5), snap("h-", 9)];
        let parent = find_parent(&snap("h-", 2), &present).unwrap();
        assert_eq!(parent, Some(snap("h-", 5)));
    }

    #[test]
    fn test_find_parent_empty() {
        assert_eq!(find_parent(&snap("h-", 2), &[]).unwrap(), None);
    }

    #[test]
    fn test_find_parent_never_returns_candidate() {
        let present: Vec<_> = (0..10).map(|m| snap("h-", m * 2)).collect();
        for minute in 0..20 {
            let candidate = snap("h-", minute);
            if let Some(parent) = find_parent(&candidate, &present).unwrap() {
                assert_ne!(parent, candidate);
            }
        }
    }

    #[test]
    fn test_find_parent_cross_prefix_fails() {
        let present = vec![snap("root-", 1)];
        assert!(find_parent(&snap("home-", 2), &present).is_err());
    }
}
