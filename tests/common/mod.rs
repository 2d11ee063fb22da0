/// Common test utilities: throwaway git remotes and working copies

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Run git with a fixed identity and no user/system configuration; panics on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test Author")
        .env("GIT_AUTHOR_EMAIL", "author@example.com")
        .env("GIT_COMMITTER_NAME", "Test Author")
        .env("GIT_COMMITTER_EMAIL", "author@example.com")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to execute git");

    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare remote with one commit on `main`, a root directory for watched
/// clones, and a separate area for peer clones that play the other machine
pub struct Sandbox {
    pub temp_dir: TempDir,
    pub remote: PathBuf,
    pub root: PathBuf,
    peers: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().canonicalize().expect("Failed to resolve temp dir");

        let remote = base.join("remote.git");
        let root = base.join("root");
        let peers = base.join("peers");
        let seed = base.join("seed");
        for dir in [&remote, &root, &peers, &seed] {
            std::fs::create_dir_all(dir).expect("Failed to create sandbox dir");
        }

        git(&remote, &["init", "--bare", "--quiet"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(&seed, &["init", "--quiet"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(seed.join("README.md"), "seed\n").expect("Failed to write seed file");
        git(&seed, &["add", "README.md"]);
        git(&seed, &["commit", "--quiet", "-m", "initial"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().expect("utf-8 path")]);
        git(&seed, &["push", "--quiet", "-u", "origin", "main"]);

        Self {
            temp_dir,
            remote,
            root,
            peers,
        }
    }

    /// Clone into the watched root
    pub fn watched_clone(&self, name: &str) -> PathBuf {
        self.clone_into(&self.root, name)
    }

    /// Clone outside the watched root
    pub fn peer_clone(&self, name: &str) -> PathBuf {
        self.clone_into(&self.peers, name)
    }

    fn clone_into(&self, parent: &Path, name: &str) -> PathBuf {
        let remote = self.remote.to_str().expect("utf-8 path");
        git(parent, &["clone", "--quiet", remote, name]);
        parent.join(name)
    }

    /// Write a file and commit it
    pub fn commit(&self, repo: &Path, file: &str, content: &str) -> String {
        std::fs::write(repo.join(file), content).expect("Failed to write file");
        git(repo, &["add", file]);
        git(repo, &["commit", "--quiet", "-m", &format!("update {}", file)]);
        head(repo)
    }

    /// Commit in a peer clone and push it, moving the remote forward
    pub fn advance_remote(&self, peer: &Path, file: &str, content: &str) -> String {
        let commit = self.commit(peer, file, content);
        git(peer, &["push", "--quiet", "origin", "main"]);
        commit
    }

    pub fn remote_head(&self) -> String {
        git(&self.remote, &["rev-parse", "refs/heads/main"])
    }

    /// Configuration file watching the sandbox root
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.temp_dir.path().join("gitifier.yml");
        let content = format!("paths:\n  - {}\n{}", self.root.display(), extra);
        std::fs::write(&path, content).expect("Failed to write test config");
        path
    }
}

pub fn head(repo: &Path) -> String {
    git(repo, &["rev-parse", "HEAD"])
}
