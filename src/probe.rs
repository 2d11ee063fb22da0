//! Status probe - classifies a working copy into a [`SyncState`]
//!
//! Uses `git status --porcelain=v2 --branch`, whose format is stable across
//! git versions and locales:
//!
//! ```text
//! # branch.oid 4f1c...
//! # branch.head main
//! # branch.upstream origin/main
//! # branch.ab +1 -2
//! 1 .M N... 100644 100644 100644 3f2a... 3f2a... src/lib.rs
//! ? notes.txt
//! ```

use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::discovery::GIT_MARKER;
use crate::error::RepoError;
use crate::git::GitBackend;
use crate::state::SyncState;

/// Structured form of one porcelain v2 status report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Current branch, `None` when detached
    pub branch: Option<String>,
    /// Tracking branch, `None` when the branch has no upstream
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    /// Tracked entries with staged or unstaged changes
    pub changed: usize,
    pub untracked: usize,
    /// Unmerged entries
    pub conflicted: usize,
}

impl StatusReport {
    /// Parse porcelain v2 output
    pub fn parse(output: &str) -> Result<Self, RepoError> {
        let mut report = StatusReport::default();

        for line in output.lines() {
            if let Some(header) = line.strip_prefix("# ") {
                report.parse_header(header)?;
                continue;
            }

            match line.chars().next() {
                Some('1') | Some('2') => report.changed += 1,
                Some('u') => report.conflicted += 1,
                Some('?') => report.untracked += 1,
                Some('!') | None => {}
                Some(_) => {
                    return Err(RepoError::ProbeFailure(format!(
                        "unexpected status line: {line}"
                    )))
                }
            }
        }

        Ok(report)
    }

    fn parse_header(&mut self, header: &str) -> Result<(), RepoError> {
        let (key, value) = header.split_once(' ').unwrap_or((header, ""));
        match key {
            "branch.head" => {
                self.branch = (value != "(detached)").then(|| value.to_string());
            }
            "branch.upstream" => self.upstream = Some(value.to_string()),
            "branch.ab" => {
                let (ahead, behind) = parse_ahead_behind(value).ok_or_else(|| {
                    RepoError::ProbeFailure(format!("malformed ahead/behind header: {value}"))
                })?;
                self.ahead = ahead;
                self.behind = behind;
            }
            // branch.oid and any future headers carry nothing we classify on
            _ => {}
        }
        Ok(())
    }

    /// Whether the working tree has local changes
    pub fn is_dirty(&self, untracked_is_dirty: bool) -> bool {
        self.changed > 0 || self.conflicted > 0 || (untracked_is_dirty && self.untracked > 0)
    }

    /// Classify into exactly one sync state; local changes win over divergence
    pub fn sync_state(&self, untracked_is_dirty: bool) -> SyncState {
        if self.is_dirty(untracked_is_dirty) {
            return SyncState::Dirty;
        }
        match (self.behind > 0, self.ahead > 0) {
            (false, false) => SyncState::Clean,
            (true, false) => SyncState::Behind,
            (false, true) => SyncState::Ahead,
            (true, true) => SyncState::BehindAndAhead,
        }
    }
}

fn parse_ahead_behind(value: &str) -> Option<(u32, u32)> {
    let mut parts = value.split_whitespace();
    let ahead = parts.next()?.strip_prefix('+')?.parse().ok()?;
    let behind = parts.next()?.strip_prefix('-')?.parse().ok()?;
    Some((ahead, behind))
}

/// Runs the status query against one working copy. Read-only.
#[derive(Clone)]
pub struct StatusProbe {
    git: Arc<dyn GitBackend>,
    untracked_is_dirty: bool,
}

impl StatusProbe {
    pub fn new(git: Arc<dyn GitBackend>, untracked_is_dirty: bool) -> Self {
        Self {
            git,
            untracked_is_dirty,
        }
    }

    /// Full status report; every failure is returned as `ProbeFailure`
    pub async fn report(&self, path: &Path) -> Result<StatusReport, RepoError> {
        let marker = tokio::fs::try_exists(path.join(GIT_MARKER))
            .await
            .unwrap_or(false);
        if !marker {
            return Err(RepoError::ProbeFailure(format!(
                "{} is not a git working copy",
                path.display()
            )));
        }

        let output = self
            .git
            .status(path)
            .await
            .map_err(|e| RepoError::ProbeFailure(format!("{e:#}")))?;

        if !output.success {
            return Err(RepoError::ProbeFailure(output.summary()));
        }

        StatusReport::parse(&output.stdout)
    }

    /// Classify a working copy
    pub async fn probe(&self, path: &Path) -> Result<SyncState, RepoError> {
        let report = self.report(path).await?;
        let state = report.sync_state(self.untracked_is_dirty);
        debug!(
            "Probed {}: {} (ahead {}, behind {}, changed {}, untracked {})",
            path.display(),
            state,
            report.ahead,
            report.behind,
            report.changed,
            report.untracked
        );
        Ok(state)
    }
}
