use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Captured result of one git invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// First non-empty line of stderr (or stdout), for error messages
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("git exited with an error")
            .to_string()
    }

    /// Whether a push was refused because the remote has diverged.
    ///
    /// `git push --porcelain` flags refused refs with `!`; the human-readable
    /// markers on stderr are checked as well.
    pub fn push_rejected(&self) -> bool {
        let porcelain = self
            .stdout
            .lines()
            .any(|line| line.starts_with('!') && line.contains("rejected"));
        let human = self.stderr.contains("[rejected]")
            || self.stderr.contains("non-fast-forward")
            || self.stderr.contains("fetch first");
        porcelain || human
    }

    /// Whether a `--ff-only` pull was refused because histories diverged
    pub fn pull_diverged(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        stderr.contains("not possible to fast-forward")
            || stderr.contains("diverging branches")
            || stderr.contains("have diverged")
    }
}

/// The version-control operations the sync engine needs.
///
/// Implementations run synchronously from the caller's point of view but must
/// not block the async runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Read-only status query in porcelain v2 format with branch headers
    async fn status(&self, path: &Path) -> Result<GitOutput>;

    /// Update remote-tracking refs from every remote, no merge
    async fn fetch_all(&self, path: &Path) -> Result<GitOutput>;

    /// Fetch and fast-forward the tracking branch
    async fn pull(&self, path: &Path) -> Result<GitOutput>;

    /// Upload local commits, never forced
    async fn push(&self, path: &Path) -> Result<GitOutput>;
}

/// `GitBackend` backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Use a specific git executable
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, path: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!("git {} in {}", args.join(" "), path.display());

        // The child is killed if the caller's timeout drops this future.
        let output = AsyncCommand::new(&self.program)
            .args(args)
            .current_dir(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn status(&self, path: &Path) -> Result<GitOutput> {
        // Without this git refreshes and rewrites .git/index under index.lock
        self.run(
            path,
            &["--no-optional-locks", "status", "--porcelain=v2", "--branch"],
        )
        .await
    }

    async fn fetch_all(&self, path: &Path) -> Result<GitOutput> {
        self.run(path, &["fetch", "--all", "--quiet"]).await
    }

    async fn pull(&self, path: &Path) -> Result<GitOutput> {
        self.run(path, &["pull", "--ff-only", "--quiet"]).await
    }

    async fn push(&self, path: &Path) -> Result<GitOutput> {
        self.run(path, &["push", "--porcelain"]).await
    }
}
