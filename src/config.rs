use dirs::config_dir;
use path_clean::PathClean;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// File name looked up in the working directory before the XDG location
pub const LOCAL_CONFIG_FILENAME: &str = "gitifier.yml";

/// Longest accepted interval or timeout
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 86_400);

/// Git commands a single reconcile may run (probe, pull, probe, push, probe)
const RECONCILE_COMMANDS: u32 = 5;

/// Main configuration structure for Gitifier
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root directories whose immediate subdirectories are scanned for repositories
    #[serde(default)]
    pub paths: Vec<String>,

    /// Repository name patterns to leave out of discovery
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Refresh/fetch cadence and operation bounds
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timer configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// Period of the local status refresh cycle
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String, // "1s"

    /// Period of the remote fetch cycle
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: String, // "15s"

    /// Upper bound for any single git command; a whole reconcile gets one
    /// such bound per command it may run
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String, // "2m"
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Reconcile drifting repositories after each remote fetch
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Maximum parallel git operations
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Treat untracked files as local changes
    #[serde(default = "default_true")]
    pub untracked_is_dirty: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Parsed timer values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub refresh: Duration,
    pub fetch: Duration,
    pub operation_timeout: Duration,
}

impl Intervals {
    /// Upper bound for a whole reconcile
    pub fn reconcile_timeout(&self) -> Duration {
        self.operation_timeout.saturating_mul(RECONCILE_COMMANDS)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_refresh_interval() -> String {
    "1s".to_string()
}
fn default_fetch_interval() -> String {
    "15s".to_string()
}
fn default_operation_timeout() -> String {
    "2m".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            fetch_interval: default_fetch_interval(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: default_true(),
            max_parallel: default_max_parallel(),
            untracked_is_dirty: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Locate and load the configuration.
    ///
    /// An explicit path wins; otherwise `./gitifier.yml`, then the XDG config
    /// location. Finding none of them is fatal.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let path = Self::resolve_path(explicit)?;
        let config = Self::load(&path)?;
        Ok((config, path))
    }

    /// Pick the configuration file to read without reading it
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let candidates = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => Self::candidate_paths(),
        };

        match candidates.iter().find(|path| path.is_file()) {
            Some(found) => Ok(found.clone()),
            None => Err(ConfigError::Missing(candidates)),
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILENAME)];
        if let Ok(path) = Self::default_config_path() {
            candidates.push(path);
        }
        candidates
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::Missing(vec![path.to_path_buf()])
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // Expand environment variables in paths
        config.expand_paths()?;
        config.validate()?;

        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> anyhow::Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to get user config directory"))?;

        Ok(config_dir.join("gitifier").join("config.yml"))
    }

    /// Expand `~` and environment variables in root paths and normalise them
    pub fn expand_paths(&mut self) -> Result<(), ConfigError> {
        for path in &mut self.paths {
            let cleaned = {
                let expanded = shellexpand::full(path.as_str())
                    .map_err(|_| ConfigError::Expand(path.clone()))?;
                PathBuf::from(expanded.as_ref()).clean()
            };
            *path = cleaned.to_string_lossy().into_owned();
        }
        Ok(())
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::NoRoots);
        }
        self.intervals()?;
        self.exclude_patterns()?;
        Ok(())
    }

    /// Configured roots as paths
    pub fn root_paths(&self) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Compiled exclusion patterns
    pub fn exclude_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Parsed timer values
    pub fn intervals(&self) -> Result<Intervals, ConfigError> {
        let parse = |key: &'static str, value: &str| {
            parse_duration(value)
                .filter(|d| !d.is_zero() && *d <= MAX_DURATION)
                .ok_or_else(|| ConfigError::InvalidDuration {
                    key,
                    value: value.to_string(),
                })
        };

        Ok(Intervals {
            refresh: parse("schedule.refresh_interval", &self.schedule.refresh_interval)?,
            fetch: parse("schedule.fetch_interval", &self.schedule.fetch_interval)?,
            operation_timeout: parse(
                "schedule.operation_timeout",
                &self.schedule.operation_timeout,
            )?,
        })
    }

    /// Build a configuration for the given roots with every other value defaulted
    pub fn with_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            exclude: Vec::new(),
            schedule: ScheduleConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse duration strings like "500ms", "30s", "5m", "1h", "2d" or bare seconds.
///
/// Returns `None` for malformed values and for values that overflow.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim().to_lowercase();
    let seconds = |number: &str, unit: u64| {
        number
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(unit))
            .map(Duration::from_secs)
    };

    if let Some(ms) = value.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = value.strip_suffix('s') {
        seconds(secs, 1)
    } else if let Some(mins) = value.strip_suffix('m') {
        seconds(mins, 60)
    } else if let Some(hours) = value.strip_suffix('h') {
        seconds(hours, 3600)
    } else if let Some(days) = value.strip_suffix('d') {
        seconds(days, 86_400)
    } else {
        seconds(&value, 1)
    }
}
