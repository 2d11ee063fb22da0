//! Scheduler - periodic probes, fetches and reconciles over the registry
//!
//! Every piece of git work is dispatched onto its own task. A repository
//! holds at most one mutating operation (fetch or reconcile) and at most one
//! probe at a time; triggers that arrive while the slot is taken are dropped,
//! not queued. A semaphore bounds the total number of git workers.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, GitOperation, RepoError};
use crate::git::GitBackend;
use crate::probe::StatusProbe;
use crate::registry::RepoRegistry;
use crate::state::{RepoId, SyncState};
use crate::sync::{ReconcileOutcome, Reconciler, SyncSummary};

/// Set of repositories with work in flight
#[derive(Debug, Default)]
struct FlightSet {
    ids: Mutex<HashSet<RepoId>>,
}

impl FlightSet {
    fn try_acquire(self: &Arc<Self>, id: &RepoId) -> Option<FlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id.clone()).then(|| FlightGuard {
            set: Arc::clone(self),
            id: id.clone(),
        })
    }

    fn contains(&self, id: &RepoId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Releases the in-flight marker when the task ends, however it ends
struct FlightGuard {
    set: Arc<FlightSet>,
    id: RepoId,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.set
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// What happened to a trigger
#[derive(Debug)]
pub enum Dispatch {
    /// Work was spawned; the handle yields the reconcile outcome, if one ran
    Started {
        id: RepoId,
        handle: JoinHandle<Option<ReconcileOutcome>>,
    },
    /// The repository already has an operation in flight
    Busy(RepoId),
    /// Automatic sync is suppressed by a sticky error
    Skipped(RepoId),
    /// No repository under that id (or the collection is empty)
    NotFound,
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started { .. })
    }

    /// Wait for spawned work to finish
    pub async fn wait(self) -> Option<ReconcileOutcome> {
        match self {
            Dispatch::Started { id, handle } => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Task for {} ended abnormally: {}", id, e);
                    None
                }
            },
            _ => None,
        }
    }
}

/// Wait for a batch of dispatches and total the reconciles into a summary
pub async fn summarize(dispatches: Vec<Dispatch>) -> SyncSummary {
    let started = Instant::now();
    let mut summary = SyncSummary::default();
    let mut pending = FuturesUnordered::new();

    for dispatch in dispatches {
        match dispatch {
            Dispatch::NotFound => {}
            Dispatch::Busy(_) | Dispatch::Skipped(_) => summary.record(None),
            started => pending.push(started.wait()),
        }
    }

    while let Some(outcome) = pending.next().await {
        summary.record(outcome.as_ref());
    }

    summary.duration = started.elapsed();
    summary
}

/// Dispatches probe, fetch and reconcile work
pub struct Scheduler {
    registry: Arc<RepoRegistry>,
    reconciler: Reconciler,
    reconcile_timeout: Duration,
    auto_sync: AtomicBool,
    workers: Arc<Semaphore>,
    exclusive: Arc<FlightSet>,
    probing: Arc<FlightSet>,
    refresh_cursor: AtomicUsize,
    fetch_cursor: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<RepoRegistry>,
        reconciler: Reconciler,
        reconcile_timeout: Duration,
        max_parallel: usize,
        auto_sync: bool,
    ) -> Self {
        Self {
            registry,
            reconciler,
            reconcile_timeout,
            auto_sync: AtomicBool::new(auto_sync),
            workers: Arc::new(Semaphore::new(max_parallel.max(1))),
            exclusive: Arc::default(),
            probing: Arc::default(),
            refresh_cursor: AtomicUsize::new(0),
            fetch_cursor: AtomicUsize::new(0),
        }
    }

    /// Wire a scheduler for the given registry from configuration
    pub fn from_config(
        config: &Config,
        registry: Arc<RepoRegistry>,
        git: Arc<dyn GitBackend>,
    ) -> Result<Self, ConfigError> {
        let intervals = config.intervals()?;
        let probe = StatusProbe::new(git.clone(), config.sync.untracked_is_dirty);
        let reconciler = Reconciler::new(git, probe, intervals.operation_timeout);
        Ok(Self::new(
            registry,
            reconciler,
            intervals.reconcile_timeout(),
            config.sync.max_parallel,
            config.sync.auto_sync,
        ))
    }

    pub fn registry(&self) -> &Arc<RepoRegistry> {
        &self.registry
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync.load(Ordering::Relaxed)
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.auto_sync.store(enabled, Ordering::Relaxed);
    }

    /// Whether a fetch or reconcile is running for the repository
    pub fn is_busy(&self, id: &RepoId) -> bool {
        self.exclusive.contains(id)
    }

    /// Probe the next repository in round-robin order
    pub fn refresh_tick(self: &Arc<Self>) -> Dispatch {
        let index = self.refresh_cursor.fetch_add(1, Ordering::Relaxed);
        match self.registry.id_at(index) {
            Some(id) => self.spawn_probe(id),
            None => Dispatch::NotFound,
        }
    }

    /// Fetch the next repository in round-robin order, then auto-sync it
    pub fn fetch_tick(self: &Arc<Self>) -> Dispatch {
        let index = self.fetch_cursor.fetch_add(1, Ordering::Relaxed);
        match self.registry.id_at(index) {
            Some(id) => self.spawn_fetch(id, self.auto_sync()),
            None => Dispatch::NotFound,
        }
    }

    /// Probe every repository
    pub fn refresh_all(self: &Arc<Self>) -> Vec<Dispatch> {
        self.registry
            .ids()
            .into_iter()
            .map(|id| self.spawn_probe(id))
            .collect()
    }

    /// Fetch every repository and reconcile the ones that drift.
    ///
    /// Repositories held by a sticky error are skipped.
    pub fn reconcile_all(self: &Arc<Self>) -> Vec<Dispatch> {
        info!("Reconciling {} repositories", self.registry.len());
        self.registry
            .ids()
            .into_iter()
            .map(|id| {
                if self.registry.has_sticky_error(&id) {
                    debug!("Skipping {}: waiting for manual resolution", id);
                    Dispatch::Skipped(id)
                } else {
                    self.spawn_fetch(id, true)
                }
            })
            .collect()
    }

    /// Fetch one repository and reconcile it if it drifts.
    ///
    /// Unlike [`Scheduler::trigger_reconcile`] this leaves sticky errors in place.
    pub fn fetch_and_reconcile(self: &Arc<Self>, id: &RepoId) -> Dispatch {
        if !self.registry.contains(id) {
            return Dispatch::NotFound;
        }
        if self.registry.has_sticky_error(id) {
            return Dispatch::Skipped(id.clone());
        }
        self.spawn_fetch(id.clone(), true)
    }

    /// User-requested reconcile.
    ///
    /// Clears any error, sticky ones included, and tries again. Dropped when
    /// the repository already has a mutating operation in flight.
    pub fn trigger_reconcile(self: &Arc<Self>, id: &RepoId) -> Dispatch {
        if !self.registry.contains(id) {
            return Dispatch::NotFound;
        }
        let Some(guard) = self.exclusive.try_acquire(id) else {
            debug!("Reconcile for {} already in flight, dropping trigger", id);
            return Dispatch::Busy(id.clone());
        };

        let this = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = this.workers.clone().acquire_owned().await.ok()?;
            this.registry.begin_reconcile(&task_id);
            Some(this.run_reconcile(&task_id).await)
        });

        Dispatch::Started {
            id: id.clone(),
            handle,
        }
    }

    fn spawn_probe(self: &Arc<Self>, id: RepoId) -> Dispatch {
        // The running operation reports the final state itself
        if self.exclusive.contains(&id) {
            return Dispatch::Busy(id);
        }
        let Some(guard) = self.probing.try_acquire(&id) else {
            return Dispatch::Busy(id);
        };

        let this = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = this.workers.clone().acquire_owned().await.ok()?;
            let result = this.reconciler.probe_bounded(task_id.path()).await;
            if !this.registry.record_probe(&task_id, result) {
                debug!("Discarding probe result for removed repository {}", task_id);
            }
            None
        });

        Dispatch::Started { id, handle }
    }

    fn spawn_fetch(self: &Arc<Self>, id: RepoId, auto_sync: bool) -> Dispatch {
        let Some(guard) = self.exclusive.try_acquire(&id) else {
            debug!("{} is busy, dropping fetch", id);
            return Dispatch::Busy(id);
        };

        let this = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = this.workers.clone().acquire_owned().await.ok()?;
            this.fetch_and_sync(&task_id, auto_sync).await
        });

        Dispatch::Started { id, handle }
    }

    /// Fetch, re-probe, then reconcile when drifting. With auto-sync the
    /// result reports what was found even when nothing needed doing.
    async fn fetch_and_sync(&self, id: &RepoId, auto_sync: bool) -> Option<ReconcileOutcome> {
        let path = id.path();

        let fetched = self.reconciler.fetch(path).await;
        let fetch_error = fetched.as_ref().err().cloned();
        if !self.registry.record_fetch(id, fetched) {
            debug!("Discarding fetch result for removed repository {}", id);
            return None;
        }

        let probed = self.reconciler.probe_bounded(path).await;
        let state = probed.clone();
        self.registry.record_probe(id, probed);

        if !auto_sync {
            return None;
        }
        let unchanged = |sync_state, error| ReconcileOutcome {
            sync_state,
            error,
            actions: Vec::new(),
        };
        if let Some(error) = fetch_error {
            return Some(unchanged(state.unwrap_or_default(), Some(error)));
        }
        let state = match state {
            Ok(state) => state,
            Err(error) => return Some(unchanged(SyncState::Unknown, Some(error))),
        };
        if self.registry.has_sticky_error(id) {
            return None;
        }
        if !state.has_drift() {
            return Some(unchanged(state, None));
        }

        debug!("Auto-syncing {} ({})", id, state);
        self.registry.begin_reconcile(id);
        Some(self.run_reconcile(id).await)
    }

    async fn run_reconcile(&self, id: &RepoId) -> ReconcileOutcome {
        let outcome = match timeout(self.reconcile_timeout, self.reconciler.reconcile(id.path()))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Reconcile of {} timed out", id);
                let error = RepoError::Timeout {
                    operation: GitOperation::Reconcile,
                    after: self.reconcile_timeout,
                };
                self.registry.record_failure(id, error.clone());
                return ReconcileOutcome {
                    sync_state: self
                        .registry
                        .get(id)
                        .map_or(SyncState::Unknown, |s| s.sync_state),
                    error: Some(error),
                    actions: Vec::new(),
                };
            }
        };

        match &outcome.error {
            None => info!("Reconciled {}: {}", id, outcome.sync_state),
            Some(error) => warn!("Reconcile of {} failed: {}", id, error),
        }

        if !self
            .registry
            .record_reconcile(id, outcome.sync_state, outcome.error.clone())
        {
            debug!("Discarding reconcile result for removed repository {}", id);
        }
        outcome
    }
}
