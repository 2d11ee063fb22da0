//! Repository registry - the single owner of the [`RepoState`] collection
//!
//! Entries are kept sorted by name, then path. Other components refer to
//! entries by [`RepoId`] and must re-resolve after a reload. Updates whose
//! repository is gone from the current collection are dropped.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::discovery::{DiscoveredRepo, Discovery};
use crate::error::RepoError;
use crate::state::{RepoId, RepoSnapshot, RepoState, SyncState};

const EVENT_CAPACITY: usize = 256;

/// Change notification for presentation layers
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
    /// One repository's state changed
    Updated(RepoSnapshot),
    /// The collection was rebuilt
    Reloaded { count: usize },
}

/// Result of resolving a user-supplied repository reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Found(RepoId),
    NotFound,
    /// The name matches several repositories; use the path instead
    Ambiguous(Vec<RepoId>),
}

pub struct RepoRegistry {
    entries: RwLock<Vec<RepoState>>,
    generation: AtomicU64,
    events: broadcast::Sender<RepoEvent>,
}

impl RepoRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Registry populated from paths (entries start `Unknown`)
    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let registry = Self::new();
        registry.replace(paths.into_iter().map(DiscoveredRepo::from));
        registry
    }

    /// Run discovery and atomically swap in the new collection.
    ///
    /// Repositories present before and after keep their classification but
    /// lose any error, sticky ones included; new ones start `Unknown`;
    /// vanished ones are dropped.
    pub async fn reload(&self, discovery: &dyn Discovery) -> anyhow::Result<usize> {
        let repos = discovery.discover().await?;
        let count = self.replace(repos);
        info!(
            "Registry reloaded from {} source: {} repositories",
            discovery.source_name(),
            count
        );
        Ok(count)
    }

    fn replace<I>(&self, repos: I) -> usize
    where
        I: IntoIterator<Item = DiscoveredRepo>,
    {
        let mut fresh: Vec<RepoState> =
            repos.into_iter().map(RepoState::from_discovered).collect();
        fresh.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.path().cmp(b.path())));
        fresh.dedup_by(|a, b| a.id() == b.id());

        let count = fresh.len();
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            for entry in fresh.iter_mut() {
                if let Some(previous) = entries.iter().find(|e| e.id() == entry.id()) {
                    entry.carry_over(previous);
                }
            }
            *entries = fresh;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(RepoEvent::Reloaded { count });
        count
    }

    /// Incremented on every reload
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Consistent copy of every entry, in display order
    pub fn snapshot(&self) -> Vec<RepoSnapshot> {
        self.read().iter().map(RepoState::snapshot).collect()
    }

    pub fn get(&self, id: &RepoId) -> Option<RepoSnapshot> {
        self.read()
            .iter()
            .find(|e| e.id() == id)
            .map(RepoState::snapshot)
    }

    pub fn contains(&self, id: &RepoId) -> bool {
        self.read().iter().any(|e| e.id() == id)
    }

    /// Identifier at a display position, wrapping modulo the collection size
    pub fn id_at(&self, index: usize) -> Option<RepoId> {
        let entries = self.read();
        if entries.is_empty() {
            return None;
        }
        Some(entries[index % entries.len()].id().clone())
    }

    pub fn ids(&self) -> Vec<RepoId> {
        self.read().iter().map(|e| e.id().clone()).collect()
    }

    /// Find a repository by id/path, or by name when the name is unique
    pub fn resolve(&self, query: &str) -> Resolved {
        let entries = self.read();
        let as_path = Path::new(query);

        if let Some(entry) = entries.iter().find(|e| e.path() == as_path) {
            return Resolved::Found(entry.id().clone());
        }
        if let Ok(canonical) = std::fs::canonicalize(as_path) {
            if let Some(entry) = entries.iter().find(|e| e.path() == canonical) {
                return Resolved::Found(entry.id().clone());
            }
        }

        let matches: Vec<RepoId> = entries
            .iter()
            .filter(|e| e.name() == query)
            .map(|e| e.id().clone())
            .collect();

        match matches.len() {
            0 => Resolved::NotFound,
            1 => Resolved::Found(matches[0].clone()),
            _ => Resolved::Ambiguous(matches),
        }
    }

    /// Apply a probe result; returns `false` when the repository is gone
    pub fn record_probe(&self, id: &RepoId, result: Result<SyncState, RepoError>) -> bool {
        self.update(id, |state| state.record_probe(result, Utc::now()))
    }

    pub fn record_fetch(&self, id: &RepoId, result: Result<(), RepoError>) -> bool {
        self.update(id, |state| state.record_fetch(result))
    }

    pub fn begin_reconcile(&self, id: &RepoId) -> bool {
        self.update(id, RepoState::begin_reconcile)
    }

    pub fn record_reconcile(
        &self,
        id: &RepoId,
        sync_state: SyncState,
        error: Option<RepoError>,
    ) -> bool {
        self.update(id, |state| {
            state.record_reconcile(sync_state, error, Utc::now())
        })
    }

    pub fn record_failure(&self, id: &RepoId, error: RepoError) -> bool {
        self.update(id, |state| state.record_failure(error))
    }

    /// Whether automatic pull/push is currently suppressed for a repository
    pub fn has_sticky_error(&self, id: &RepoId) -> bool {
        self.read()
            .iter()
            .find(|e| e.id() == id)
            .is_some_and(RepoState::has_sticky_error)
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.events.subscribe()
    }

    fn update<F>(&self, id: &RepoId, apply: F) -> bool
    where
        F: FnOnce(&mut RepoState),
    {
        let snapshot = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = entries.iter_mut().find(|e| e.id() == id) else {
                debug!("Discarding result for {}: no longer registered", id);
                return false;
            };

            // Timestamps alone do not count as a change
            let before = (entry.sync_state(), entry.last_error().cloned());
            apply(entry);
            if (entry.sync_state(), entry.last_error().cloned()) == before {
                return true;
            }
            entry.snapshot()
        };

        let _ = self.events.send(RepoEvent::Updated(snapshot));
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<RepoState>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RepoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDiscovery;
    use assert_fs::prelude::*;

    fn names(registry: &RepoRegistry) -> Vec<String> {
        registry.snapshot().into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn test_sorted_by_name_then_path() {
        let registry = RepoRegistry::from_paths(vec![
            PathBuf::from("/b/zeta"),
            PathBuf::from("/b/alpha"),
            PathBuf::from("/a/alpha"),
            PathBuf::from("/a/Beta"),
        ]);

        let snapshot = registry.snapshot();
        let order: Vec<_> = snapshot.iter().map(|s| s.path.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/a/Beta"),
                PathBuf::from("/a/alpha"),
                PathBuf::from("/b/alpha"),
                PathBuf::from("/b/zeta"),
            ]
        );
        assert!(snapshot.iter().all(|s| s.sync_state == SyncState::Unknown));
    }

    #[test]
    fn test_resolve() {
        let registry = RepoRegistry::from_paths(vec![
            PathBuf::from("/a/shared"),
            PathBuf::from("/b/shared"),
            PathBuf::from("/a/unique"),
        ]);

        assert_eq!(
            registry.resolve("unique"),
            Resolved::Found(RepoId::new("/a/unique"))
        );
        assert_eq!(
            registry.resolve("/b/shared"),
            Resolved::Found(RepoId::new("/b/shared"))
        );
        assert!(matches!(registry.resolve("shared"), Resolved::Ambiguous(ids) if ids.len() == 2));
        assert_eq!(registry.resolve("missing"), Resolved::NotFound);
    }

    #[test]
    fn test_id_at_wraps() {
        let registry =
            RepoRegistry::from_paths(vec![PathBuf::from("/r/a"), PathBuf::from("/r/b")]);
        assert_eq!(registry.id_at(0), Some(RepoId::new("/r/a")));
        assert_eq!(registry.id_at(3), Some(RepoId::new("/r/b")));
        assert_eq!(RepoRegistry::new().id_at(0), None);
    }

    #[test]
    fn test_update_emits_event_only_on_change() {
        let registry = RepoRegistry::from_paths(vec![PathBuf::from("/r/a")]);
        let mut events = registry.subscribe();
        let id = RepoId::new("/r/a");

        assert!(registry.record_fetch(&id, Ok(())));
        assert!(events.try_recv().is_err());

        assert!(registry.record_reconcile(&id, SyncState::Clean, None));
        match events.try_recv() {
            Ok(RepoEvent::Updated(snapshot)) => {
                assert_eq!(snapshot.sync_state, SyncState::Clean);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    fn discovered(paths: &[&str]) -> Vec<DiscoveredRepo> {
        paths.iter().map(|p| DiscoveredRepo::from(PathBuf::from(p))).collect()
    }

    #[test]
    fn test_reload_keeps_state_and_discards_stale_results() {
        let registry =
            RepoRegistry::from_paths(vec![PathBuf::from("/r/keep"), PathBuf::from("/r/gone")]);
        let keep = RepoId::new("/r/keep");
        let gone = RepoId::new("/r/gone");
        registry.record_probe(&keep, Ok(SyncState::Ahead));

        let before = registry.generation();
        registry.replace(discovered(&["/r/keep", "/r/new"]));
        assert_eq!(registry.generation(), before + 1);

        assert_eq!(names(&registry), vec!["keep", "new"]);
        assert_eq!(registry.get(&keep).unwrap().sync_state, SyncState::Ahead);
        assert!(!registry.contains(&gone));

        // A reconcile that finishes after the reload is dropped
        assert!(!registry.record_reconcile(&gone, SyncState::Clean, None));
        assert!(registry.get(&gone).is_none());
    }

    #[test]
    fn test_reload_clears_merge_conflict() {
        let registry = RepoRegistry::from_paths(vec![PathBuf::from("/r/keep")]);
        let keep = RepoId::new("/r/keep");
        registry.record_reconcile(&keep, SyncState::Ahead, Some(RepoError::MergeConflict));
        assert!(registry.has_sticky_error(&keep));

        registry.replace(discovered(&["/r/keep"]));
        assert!(!registry.has_sticky_error(&keep));

        assert!(registry.record_probe(&keep, Ok(SyncState::Clean)));
        let snapshot = registry.get(&keep).unwrap();
        assert_eq!(snapshot.sync_state, SyncState::Clean);
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn test_reload_uses_discovered_name() {
        let registry = RepoRegistry::new();
        registry.replace(vec![DiscoveredRepo::new("/elsewhere/bar", "foo")]);

        assert_eq!(names(&registry), vec!["foo"]);
        assert_eq!(registry.resolve("foo"), Resolved::Found(RepoId::new("/elsewhere/bar")));
    }

    #[test]
    fn test_duplicate_paths_kept_once() {
        let registry = RepoRegistry::from_paths(vec![
            PathBuf::from("/r/a"),
            PathBuf::from("/r/a"),
        ]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_from_discovery() {
        let root = assert_fs::TempDir::new().unwrap();
        root.child("one/.git").create_dir_all().unwrap();
        root.child("two/.git").create_dir_all().unwrap();

        let registry = RepoRegistry::new();
        let mut events = registry.subscribe();
        let discovery = LocalDiscovery::new(vec![root.path().to_path_buf()]);

        assert_eq!(registry.reload(&discovery).await.unwrap(), 2);
        assert_eq!(names(&registry), vec!["one", "two"]);
        assert_eq!(events.try_recv().unwrap(), RepoEvent::Reloaded { count: 2 });

        std::fs::remove_dir_all(root.path().join("two")).unwrap();
        assert_eq!(registry.reload(&discovery).await.unwrap(), 1);
        assert_eq!(names(&registry), vec!["one"]);
    }
}
