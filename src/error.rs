//! Error kinds surfaced by the sync engine
//!
//! Per-repository failures never escape as faults: they are recorded on the
//! repository's state as a [`RepoError`] and rendered by the presentation layer.
//! Configuration failures ([`ConfigError`]) are fatal at startup.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Git operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GitOperation {
    Status,
    Fetch,
    Pull,
    Push,
    Reconcile,
}

impl GitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitOperation::Status => "status",
            GitOperation::Fetch => "fetch",
            GitOperation::Pull => "pull",
            GitOperation::Push => "push",
            GitOperation::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for GitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error condition attached to a single repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RepoError {
    /// The status query could not be run or its output could not be parsed
    #[error("status probe failed: {0}")]
    ProbeFailure(String),

    /// The remote rejected an update, or local and remote history diverged
    #[error("merge conflict: remote rejected a non-fast-forward update")]
    MergeConflict,

    /// A git invocation exceeded its time bound
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: GitOperation,
        #[serde(serialize_with = "duration_secs::serialize")]
        after: Duration,
    },

    /// A git invocation failed for a reason other than a conflict
    #[error("{operation} failed: {message}")]
    CommandFailed {
        operation: GitOperation,
        message: String,
    },
}

impl RepoError {
    /// Sticky errors suppress automatic pull/push until a manual reconcile succeeds.
    pub fn is_sticky(&self) -> bool {
        matches!(self, RepoError::MergeConflict)
    }

    /// Short label for compact displays
    pub fn label(&self) -> &'static str {
        match self {
            RepoError::ProbeFailure(_) => "probe-failure",
            RepoError::MergeConflict => "merge-conflict",
            RepoError::Timeout { .. } => "timeout",
            RepoError::CommandFailed { .. } => "command-failed",
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// Configuration errors (fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration source could be found
    #[error("configuration not found (looked in: {})", display_paths(.0))]
    Missing(Vec<PathBuf>),

    /// The configuration names no root paths to scan
    #[error("configuration lists no repository paths; add at least one entry under `paths`")]
    NoRoots,

    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid duration {value:?} for `{key}`; use a format like '500ms', '30s', '5m', '1h'")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid exclude pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to expand path {0:?}")]
    Expand(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
