//! Repository discovery
//!
//! Scans configured root directories for working copies. Only immediate
//! subdirectories of each root are considered; a subdirectory qualifies when
//! it contains a `.git` marker (a directory, or a file for worktrees and
//! submodules).

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Name of the version-control metadata marker
pub const GIT_MARKER: &str = ".git";

/// A working copy found by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepo {
    /// Canonical location, used as the identifier
    pub path: PathBuf,
    /// Final component of the path as it was found under its root
    pub name: String,
}

impl DiscoveredRepo {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

impl From<PathBuf> for DiscoveredRepo {
    fn from(path: PathBuf) -> Self {
        let name = display_name(&path);
        Self { path, name }
    }
}

/// Final path component, or the whole path when there is none
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Source of working copies
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Discover working copies; order is not significant
    async fn discover(&self) -> Result<Vec<DiscoveredRepo>>;

    /// Source name for display/logging
    fn source_name(&self) -> &'static str;
}

/// Scans immediate subdirectories of local roots
pub struct LocalDiscovery {
    roots: Vec<PathBuf>,
    exclude: Vec<Regex>,
}

impl LocalDiscovery {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            exclude: Vec::new(),
        }
    }

    /// Skip repositories whose directory name matches any pattern
    pub fn with_exclusions(mut self, exclude: Vec<Regex>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Build from configuration (roots + exclusion patterns)
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.root_paths()).with_exclusions(config.exclude_patterns()?))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.exclude.iter().any(|re| re.is_match(&name))
    }

    async fn scan_root(&self, root: &Path, found: &mut BTreeMap<PathBuf, String>) {
        debug!("Inspecting {}", root.display());

        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping root {}: {}", root.display(), e);
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while listing {}: {}", root.display(), e);
                    break;
                }
            };

            let path = entry.path();
            if !is_working_copy(&path).await {
                continue;
            }
            if self.is_excluded(&path) {
                debug!("Excluded {}", path.display());
                continue;
            }

            let name = display_name(&path);
            let canonical = tokio::fs::canonicalize(&path).await.unwrap_or(path);
            if let Entry::Vacant(slot) = found.entry(canonical) {
                debug!("  - found {} ({})", name, slot.key().display());
                slot.insert(name);
            }
        }
    }
}

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredRepo>> {
        let mut found = BTreeMap::new();
        for root in &self.roots {
            self.scan_root(root, &mut found).await;
        }

        info!(
            "Discovered {} repositories under {} root(s)",
            found.len(),
            self.roots.len()
        );
        Ok(found
            .into_iter()
            .map(|(path, name)| DiscoveredRepo::new(path, name))
            .collect())
    }

    fn source_name(&self) -> &'static str {
        "local"
    }
}

/// Directory containing a `.git` marker
pub async fn is_working_copy(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    is_dir && tokio::fs::try_exists(path.join(GIT_MARKER)).await.unwrap_or(false)
}
