//! Preflight checks behind `gitifier doctor`

use std::path::Path;

use crate::config::Config;
use crate::discovery::{Discovery, LocalDiscovery};

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Configuration file found and valid
    pub config: CheckResult,
    /// Configured root directories exist
    pub roots: CheckResult,
    /// Working copies found under the roots (warning only)
    pub repositories: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(explicit_config: Option<&Path>) -> Self {
        let git = Self::check_git();

        let (config, config_check) = match Config::discover(explicit_config) {
            Ok((config, path)) => (
                Some(config),
                CheckResult::ok_with_details("Configuration loaded", path.display().to_string()),
            ),
            Err(e) => (
                None,
                CheckResult::error_with_details(
                    "Configuration unusable",
                    format!("{}\nRun: gitifier init --path <DIR>", e),
                ),
            ),
        };

        let (roots, repositories) = match &config {
            Some(config) => (
                Self::check_roots(config),
                Self::check_repositories(config).await,
            ),
            None => (
                CheckResult::error("Roots not checked without a configuration"),
                CheckResult::error("Repositories not checked without a configuration"),
            ),
        };

        Self {
            git,
            config: config_check,
            roots,
            repositories,
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// A missing root is reported but only fails when every root is missing
    fn check_roots(config: &Config) -> CheckResult {
        let roots = config.root_paths();
        let missing: Vec<_> = roots
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| p.display().to_string())
            .collect();

        if missing.is_empty() {
            CheckResult::ok_with_details(
                format!("{} root director{} found", roots.len(), plural_y(roots.len())),
                roots
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        } else if missing.len() == roots.len() {
            CheckResult::error_with_details("No root directory exists", missing.join("\n"))
        } else {
            CheckResult::warning_with_details(
                format!("{} root director{} missing", missing.len(), plural_y(missing.len())),
                missing.join("\n"),
            )
        }
    }

    async fn check_repositories(config: &Config) -> CheckResult {
        let discovery = match LocalDiscovery::from_config(config) {
            Ok(discovery) => discovery,
            Err(e) => return CheckResult::error_with_details("Invalid exclusions", e.to_string()),
        };

        match discovery.discover().await {
            Ok(found) if found.is_empty() => CheckResult::warning_with_details(
                "No repositories found",
                "Only immediate subdirectories containing .git are watched",
            ),
            Ok(found) => CheckResult::ok_with_details(
                format!("{} repositories found", found.len()),
                format!("source: {}", discovery.source_name()),
            ),
            Err(e) => CheckResult::error_with_details("Discovery failed", e.to_string()),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Configuration", &self.config),
            ("Root Directories", &self.roots),
            ("Repositories", &self.repositories),
        ]
    }
}

fn plural_y(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}
