//! Gitifier - keeps a collection of local git working copies in sync
//!
//! Working copies are discovered under configured root directories, probed
//! periodically, fetched from their remotes, and fast-forwarded or pushed
//! automatically when that is safe. Anything that needs a human (local
//! changes, diverged history, rejected pushes) is reported and left alone.
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`]: Working-copy discovery under root directories
//! - [`git`]: The git command seam
//! - [`probe`]: Status classification
//! - [`sync`]: Pull/push reconcile for one repository
//! - [`registry`]: The repository collection and its change events
//! - [`scheduler`]: Round-robin ticks and in-flight bookkeeping
//! - [`daemon`]: The long-running engine and its control handle

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod git;
pub mod health;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod sync;

pub use config::Config;
pub use daemon::{Command, Daemon, DaemonHandle};
pub use discovery::{DiscoveredRepo, Discovery, LocalDiscovery};
pub use error::{ConfigError, GitOperation, RepoError};
pub use git::{GitBackend, GitCli, GitOutput};
pub use health::HealthCheck;
pub use probe::{StatusProbe, StatusReport};
pub use registry::{RepoEvent, RepoRegistry, Resolved};
pub use scheduler::{Dispatch, Scheduler};
pub use state::{Indicator, RepoId, RepoSnapshot, RepoState, SyncState};
pub use sync::{ReconcileOutcome, Reconciler, SyncAction, SyncSummary};
