//! Repository state - the per-repository data the engine maintains
//!
//! A [`RepoState`] is created by discovery in [`SyncState::Unknown`] and is
//! afterwards written only through the `record_*` methods, which are fed by
//! probe, fetch and reconcile results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::discovery::DiscoveredRepo;
use crate::error::RepoError;

/// Last classification produced by the status probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Never probed, or the last probe failed
    #[default]
    Unknown,
    /// No local changes, no divergence from upstream
    Clean,
    /// Uncommitted local changes; never auto-synced
    Dirty,
    /// Upstream has commits not merged locally
    Behind,
    /// Local commits not yet pushed
    Ahead,
    /// Both sides have commits the other lacks
    BehindAndAhead,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unknown => "unknown",
            SyncState::Clean => "clean",
            SyncState::Dirty => "dirty",
            SyncState::Behind => "behind",
            SyncState::Ahead => "ahead",
            SyncState::BehindAndAhead => "behind_and_ahead",
        }
    }

    /// Whether local and remote history differ on a clean tree
    pub fn has_drift(&self) -> bool {
        matches!(
            self,
            SyncState::Behind | SyncState::Ahead | SyncState::BehindAndAhead
        )
    }

    pub fn needs_pull(&self) -> bool {
        matches!(self, SyncState::Behind | SyncState::BehindAndAhead)
    }

    pub fn needs_push(&self) -> bool {
        matches!(self, SyncState::Ahead | SyncState::BehindAndAhead)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable repository identifier: the absolute path of the working copy.
///
/// Survives reloads, unlike a position in the collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RepoId(PathBuf);

impl RepoId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for RepoId {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// At-a-glance indicator, in the precedence a status icon uses:
/// error, then dirty, then pull, then push, then ok.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Unknown,
    Ok,
    Dirty,
    Pull,
    Push,
    Error,
}

impl Indicator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Indicator::Unknown => "?",
            Indicator::Ok => "✓",
            Indicator::Dirty => "✗",
            Indicator::Pull => "↓",
            Indicator::Push => "↑",
            Indicator::Error => "!",
        }
    }
}

/// A discovered working copy and everything known about it
#[derive(Debug, Clone)]
pub struct RepoState {
    id: RepoId,
    name: String,
    sync_state: SyncState,
    last_error: Option<RepoError>,
    last_checked_at: Option<DateTime<Utc>>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl RepoState {
    /// New entry in `Unknown` state; the display name is the final path component
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_discovered(DiscoveredRepo::from(path.into()))
    }

    /// New entry in `Unknown` state, named as discovery found it
    pub fn from_discovered(repo: DiscoveredRepo) -> Self {
        Self {
            id: RepoId::new(repo.path),
            name: repo.name,
            sync_state: SyncState::Unknown,
            last_error: None,
            last_checked_at: None,
            last_synced_at: None,
        }
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.id.path()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn last_error(&self) -> Option<&RepoError> {
        self.last_error.as_ref()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Whether automatic pull/push is suppressed for this repository
    pub fn has_sticky_error(&self) -> bool {
        self.last_error.as_ref().is_some_and(RepoError::is_sticky)
    }

    pub fn indicator(&self) -> Indicator {
        if self.last_error.is_some() {
            return Indicator::Error;
        }
        match self.sync_state {
            SyncState::Unknown => Indicator::Unknown,
            SyncState::Clean => Indicator::Ok,
            SyncState::Dirty => Indicator::Dirty,
            SyncState::Behind | SyncState::BehindAndAhead => Indicator::Pull,
            SyncState::Ahead => Indicator::Push,
        }
    }

    /// Apply a status probe result.
    ///
    /// A successful probe clears an earlier probe failure but leaves sync
    /// errors alone; a failed probe resets the state to `Unknown` so the
    /// repository never looks clean by accident. Sticky errors are kept.
    pub fn record_probe(&mut self, result: Result<SyncState, RepoError>, at: DateTime<Utc>) {
        self.last_checked_at = Some(at);
        match result {
            Ok(state) => {
                self.sync_state = state;
                if matches!(self.last_error, Some(RepoError::ProbeFailure(_))) {
                    self.last_error = None;
                }
            }
            Err(error) => {
                self.sync_state = SyncState::Unknown;
                if !self.has_sticky_error() {
                    self.last_error = Some(error);
                }
            }
        }
    }

    /// Record a failure that leaves the last classification in place
    pub fn record_failure(&mut self, error: RepoError) {
        if !self.has_sticky_error() {
            self.last_error = Some(error);
        }
    }

    /// Apply the result of a remote fetch (before the follow-up probe).
    ///
    /// A successful fetch clears non-sticky errors; a failed one records its
    /// error unless a sticky one is already present.
    pub fn record_fetch(&mut self, result: Result<(), RepoError>) {
        match result {
            Ok(()) => {
                if !self.has_sticky_error() {
                    self.last_error = None;
                }
            }
            Err(error) => {
                if !self.has_sticky_error() {
                    self.last_error = Some(error);
                }
            }
        }
    }

    /// Clear the error at the start of a reconcile attempt
    pub fn begin_reconcile(&mut self) {
        self.last_error = None;
    }

    /// Take over what a reload keeps from the previous entry.
    ///
    /// The classification and timestamps survive; any error, sticky or not,
    /// is dropped.
    pub fn carry_over(&mut self, previous: &RepoState) {
        self.sync_state = previous.sync_state;
        self.last_checked_at = previous.last_checked_at;
        self.last_synced_at = previous.last_synced_at;
        self.last_error = None;
    }

    /// Apply a finished reconcile
    pub fn record_reconcile(
        &mut self,
        state: SyncState,
        error: Option<RepoError>,
        at: DateTime<Utc>,
    ) {
        self.sync_state = state;
        self.last_checked_at = Some(at);
        if error.is_none() {
            self.last_synced_at = Some(at);
        }
        self.last_error = error;
    }

    pub fn snapshot(&self) -> RepoSnapshot {
        RepoSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path().to_path_buf(),
            sync_state: self.sync_state,
            last_error: self.last_error.clone(),
            indicator: self.indicator(),
            last_checked_at: self.last_checked_at,
            last_synced_at: self.last_synced_at,
        }
    }
}

/// Read-only copy of a repository's state for presentation layers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoSnapshot {
    pub id: RepoId,
    pub name: String,
    pub path: PathBuf,
    pub sync_state: SyncState,
    pub last_error: Option<RepoError>,
    pub indicator: Indicator,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}
