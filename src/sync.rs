//! Sync Action - pull/push decision and execution for one repository
//!
//! A reconcile re-probes before acting, never touches a dirty tree, only
//! fast-forwards on pull, never forces a push, and stops at the first
//! rejection so a human can resolve it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{GitOperation, RepoError};
use crate::git::{GitBackend, GitOutput};
use crate::probe::StatusProbe;
use crate::state::SyncState;

/// Mutating operation performed during a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Pulled,
    Pushed,
}

/// Result of one reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Final classification (from the closing probe when it succeeded)
    pub sync_state: SyncState,
    pub error: Option<RepoError>,
    /// Mutating operations that completed, in order
    pub actions: Vec<SyncAction>,
}

impl ReconcileOutcome {
    fn new(sync_state: SyncState) -> Self {
        Self {
            sync_state,
            error: None,
            actions: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes reconciles. Callers guarantee one in-flight reconcile per repository.
#[derive(Clone)]
pub struct Reconciler {
    git: Arc<dyn GitBackend>,
    probe: StatusProbe,
    operation_timeout: Duration,
}

impl Reconciler {
    pub fn new(git: Arc<dyn GitBackend>, probe: StatusProbe, operation_timeout: Duration) -> Self {
        Self {
            git,
            probe,
            operation_timeout,
        }
    }

    pub fn probe(&self) -> &StatusProbe {
        &self.probe
    }

    /// Remote fetch with no merge
    pub async fn fetch(&self, path: &Path) -> Result<(), RepoError> {
        let output = self
            .bounded(GitOperation::Fetch, self.git.fetch_all(path))
            .await?;
        if output.success {
            debug!("Fetched {}", path.display());
            Ok(())
        } else {
            warn!("Fetch failed for {}: {}", path.display(), output.summary());
            Err(RepoError::CommandFailed {
                operation: GitOperation::Fetch,
                message: output.summary(),
            })
        }
    }

    /// Probe with the operation timeout applied
    pub async fn probe_bounded(&self, path: &Path) -> Result<SyncState, RepoError> {
        match timeout(self.operation_timeout, self.probe.probe(path)).await {
            Ok(result) => result,
            Err(_) => Err(RepoError::Timeout {
                operation: GitOperation::Status,
                after: self.operation_timeout,
            }),
        }
    }

    /// Pull when behind, then push when (still) ahead, then report the final state
    pub async fn reconcile(&self, path: &Path) -> ReconcileOutcome {
        // State may be stale; decide on a fresh probe.
        let state = match self.probe_bounded(path).await {
            Ok(state) => state,
            Err(error) => {
                return ReconcileOutcome {
                    sync_state: SyncState::Unknown,
                    error: Some(error),
                    actions: Vec::new(),
                }
            }
        };

        let mut outcome = ReconcileOutcome::new(state);

        if !state.has_drift() {
            debug!("Nothing to reconcile for {} ({})", path.display(), state);
            return outcome;
        }

        let mut state = state;
        if state.needs_pull() {
            if let Err(error) = self.pull(path).await {
                return self.finish(path, outcome, Some(error)).await;
            }
            outcome.actions.push(SyncAction::Pulled);

            // A pull can leave local commits to push; look again before pushing.
            state = match self.probe_bounded(path).await {
                Ok(state) => state,
                Err(error) => {
                    outcome.sync_state = SyncState::Unknown;
                    outcome.error = Some(error);
                    return outcome;
                }
            };
        }

        if state.needs_push() {
            if let Err(error) = self.push(path).await {
                return self.finish(path, outcome, Some(error)).await;
            }
            outcome.actions.push(SyncAction::Pushed);
        }

        self.finish(path, outcome, None).await
    }

    /// Closing probe; its state is what the caller reports
    async fn finish(
        &self,
        path: &Path,
        mut outcome: ReconcileOutcome,
        error: Option<RepoError>,
    ) -> ReconcileOutcome {
        match self.probe_bounded(path).await {
            Ok(state) => {
                outcome.sync_state = state;
                outcome.error = error;
            }
            Err(probe_error) => {
                outcome.sync_state = SyncState::Unknown;
                outcome.error = error.or(Some(probe_error));
            }
        }
        outcome
    }

    async fn pull(&self, path: &Path) -> Result<(), RepoError> {
        info!("Pulling {}", path.display());
        let output = self.bounded(GitOperation::Pull, self.git.pull(path)).await?;
        if output.success {
            return Ok(());
        }

        if output.pull_diverged() {
            warn!(
                "Pull refused for {}: history diverged, manual merge required",
                path.display()
            );
            Err(RepoError::MergeConflict)
        } else {
            warn!("Pull failed for {}: {}", path.display(), output.summary());
            Err(RepoError::CommandFailed {
                operation: GitOperation::Pull,
                message: output.summary(),
            })
        }
    }

    async fn push(&self, path: &Path) -> Result<(), RepoError> {
        info!("Pushing {}", path.display());
        let output = self.bounded(GitOperation::Push, self.git.push(path)).await?;
        if output.success && !output.push_rejected() {
            return Ok(());
        }

        if output.push_rejected() {
            warn!(
                "Push rejected for {}: remote has diverged, manual merge required",
                path.display()
            );
            Err(RepoError::MergeConflict)
        } else {
            warn!("Push failed for {}: {}", path.display(), output.summary());
            Err(RepoError::CommandFailed {
                operation: GitOperation::Push,
                message: output.summary(),
            })
        }
    }

    async fn bounded<F>(&self, operation: GitOperation, future: F) -> Result<GitOutput, RepoError>
    where
        F: std::future::Future<Output = anyhow::Result<GitOutput>>,
    {
        match timeout(self.operation_timeout, future).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RepoError::CommandFailed {
                operation,
                message: format!("{e:#}"),
            }),
            Err(_) => {
                warn!(
                    "git {} timed out after {}s",
                    operation,
                    self.operation_timeout.as_secs()
                );
                Err(RepoError::Timeout {
                    operation,
                    after: self.operation_timeout,
                })
            }
        }
    }
}

/// Results from a batch reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub pulled: usize,
    pub pushed: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl SyncSummary {
    /// Fold one repository's outcome into the summary; `None` means skipped
    pub fn record(&mut self, outcome: Option<&ReconcileOutcome>) {
        self.total_repositories += 1;
        let Some(outcome) = outcome else {
            self.skipped += 1;
            return;
        };

        if outcome.error.is_some() {
            self.failed += 1;
        } else if outcome.actions.is_empty() {
            if outcome.sync_state == SyncState::Clean {
                self.up_to_date += 1;
            } else {
                self.skipped += 1;
            }
        }
        for action in &outcome.actions {
            match action {
                SyncAction::Pulled => self.pulled += 1,
                SyncAction::Pushed => self.pushed += 1,
            }
        }
    }
}
