mod common;

use common::{git, head, Sandbox};
use gitifier::{
    Config, Dispatch, GitBackend, GitCli, LocalDiscovery, RepoError, RepoId, RepoRegistry,
    Scheduler, SyncAction, SyncState,
};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Registry discovered from the sandbox root, driven by the real git CLI
async fn scheduler_for(sandbox: &Sandbox) -> Arc<Scheduler> {
    let config = Config::with_paths([sandbox.root.to_string_lossy().into_owned()]);
    let registry = Arc::new(RepoRegistry::new());
    registry
        .reload(&LocalDiscovery::from_config(&config).unwrap())
        .await
        .unwrap();
    Arc::new(Scheduler::from_config(&config, registry, Arc::new(GitCli::new())).unwrap())
}

#[tokio::test]
async fn test_behind_repository_is_fast_forwarded() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    let pushed = sandbox.advance_remote(&peer, "notes.txt", "from elsewhere\n");

    let scheduler = scheduler_for(&sandbox).await;
    let id = RepoId::new(&local);
    let outcome = scheduler.fetch_and_reconcile(&id).wait().await.unwrap();

    assert_eq!(outcome.actions, vec![SyncAction::Pulled]);
    assert_eq!(outcome.sync_state, SyncState::Clean);
    assert_eq!(head(&local), pushed);
    assert!(local.join("notes.txt").exists());

    let snapshot = scheduler.registry().get(&id).unwrap();
    assert_eq!(snapshot.sync_state, SyncState::Clean);
    assert!(snapshot.last_error.is_none());
    assert!(snapshot.last_synced_at.is_some());
}

#[tokio::test]
async fn test_ahead_repository_is_pushed() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let committed = sandbox.commit(&local, "local.txt", "local work\n");

    let scheduler = scheduler_for(&sandbox).await;
    let outcome = scheduler
        .fetch_and_reconcile(&RepoId::new(&local))
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.actions, vec![SyncAction::Pushed]);
    assert_eq!(outcome.sync_state, SyncState::Clean);
    assert_eq!(sandbox.remote_head(), committed);
}

#[tokio::test]
async fn test_rejected_push_is_sticky_until_manual_reconcile() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    let local_commit = sandbox.commit(&local, "local.txt", "local\n");
    let remote_commit = sandbox.advance_remote(&peer, "remote.txt", "remote\n");

    let scheduler = scheduler_for(&sandbox).await;
    let id = RepoId::new(&local);

    // No fetch first: the local view still says "ahead", so the push is attempted
    let outcome = scheduler.trigger_reconcile(&id).wait().await.unwrap();
    assert_eq!(outcome.error, Some(RepoError::MergeConflict));
    assert!(outcome.actions.is_empty());
    assert_eq!(sandbox.remote_head(), remote_commit);
    assert_eq!(head(&local), local_commit);

    assert!(scheduler.registry().has_sticky_error(&id));
    assert!(matches!(scheduler.fetch_and_reconcile(&id), Dispatch::Skipped(_)));
    assert!(matches!(scheduler.reconcile_all().as_slice(), [Dispatch::Skipped(_)]));

    // Resolved by hand: rebase onto the remote, then ask again
    git(&local, &["pull", "--quiet", "--rebase", "origin", "main"]);
    let outcome = scheduler.trigger_reconcile(&id).wait().await.unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.actions, vec![SyncAction::Pushed]);
    assert_eq!(sandbox.remote_head(), head(&local));
    assert!(scheduler.registry().get(&id).unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_diverged_history_is_not_merged() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    let local_commit = sandbox.commit(&local, "local.txt", "local\n");
    sandbox.advance_remote(&peer, "remote.txt", "remote\n");

    let scheduler = scheduler_for(&sandbox).await;
    let id = RepoId::new(&local);
    let outcome = scheduler.fetch_and_reconcile(&id).wait().await.unwrap();

    assert_eq!(outcome.error, Some(RepoError::MergeConflict));
    assert_eq!(head(&local), local_commit);
    assert!(!local.join("remote.txt").exists());
    assert!(scheduler.registry().has_sticky_error(&id));
}

#[tokio::test]
async fn test_dirty_repository_is_left_alone() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    let before = head(&local);
    sandbox.advance_remote(&peer, "remote.txt", "remote\n");
    std::fs::write(local.join("README.md"), "edited locally\n").unwrap();

    let scheduler = scheduler_for(&sandbox).await;
    let outcome = scheduler
        .fetch_and_reconcile(&RepoId::new(&local))
        .wait()
        .await
        .unwrap();

    assert!(outcome.actions.is_empty());
    assert!(outcome.is_success());
    assert_eq!(outcome.sync_state, SyncState::Dirty);
    assert_eq!(head(&local), before);
    assert_eq!(
        std::fs::read_to_string(local.join("README.md")).unwrap(),
        "edited locally\n"
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    sandbox.commit(&local, "local.txt", "local\n");

    let scheduler = scheduler_for(&sandbox).await;
    let id = RepoId::new(&local);
    let first = scheduler.trigger_reconcile(&id).wait().await.unwrap();
    let second = scheduler.trigger_reconcile(&id).wait().await.unwrap();

    assert_eq!(first.actions, vec![SyncAction::Pushed]);
    assert!(second.actions.is_empty());
    assert_eq!(second.sync_state, SyncState::Clean);
}

#[tokio::test]
async fn test_probe_classifies_after_fetch() {
    let sandbox = Sandbox::new();
    let behind = sandbox.watched_clone("behind");
    let clean = sandbox.watched_clone("clean");
    let untracked = sandbox.watched_clone("untracked");
    let peer = sandbox.peer_clone("peer");

    sandbox.advance_remote(&peer, "remote.txt", "remote\n");
    git(&behind, &["fetch", "--quiet"]);
    std::fs::write(untracked.join("scratch.txt"), "wip\n").unwrap();

    let scheduler = scheduler_for(&sandbox).await;
    for dispatch in scheduler.refresh_all() {
        dispatch.wait().await;
    }

    let registry = scheduler.registry();
    let state = |path: &std::path::Path| registry.get(&RepoId::new(path)).unwrap().sync_state;
    assert_eq!(state(&behind), SyncState::Behind);
    assert_eq!(state(&clean), SyncState::Clean);
    assert_eq!(state(&untracked), SyncState::Dirty);
}

#[tokio::test]
async fn test_reload_tracks_added_and_removed_clones() {
    let sandbox = Sandbox::new();
    let alpha = sandbox.watched_clone("alpha");
    let scheduler = scheduler_for(&sandbox).await;
    let registry = scheduler.registry().clone();
    let config = Config::with_paths([sandbox.root.to_string_lossy().into_owned()]);
    let discovery = LocalDiscovery::from_config(&config).unwrap();

    for dispatch in scheduler.refresh_all() {
        dispatch.wait().await;
    }
    assert_eq!(registry.len(), 1);

    let beta = sandbox.watched_clone("beta");
    registry.reload(&discovery).await.unwrap();
    assert_eq!(registry.len(), 2);
    // Survivors keep their state, newcomers start unknown
    assert_eq!(registry.get(&RepoId::new(&alpha)).unwrap().sync_state, SyncState::Clean);
    assert_eq!(registry.get(&RepoId::new(&beta)).unwrap().sync_state, SyncState::Unknown);

    std::fs::remove_dir_all(&alpha).unwrap();
    registry.reload(&discovery).await.unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.get(&RepoId::new(&alpha)).is_none());
}

#[tokio::test]
async fn test_reload_clears_merge_conflict() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    sandbox.commit(&local, "local.txt", "local\n");
    sandbox.advance_remote(&peer, "remote.txt", "remote\n");

    let scheduler = scheduler_for(&sandbox).await;
    let registry = scheduler.registry().clone();
    let id = RepoId::new(&local);
    scheduler.fetch_and_reconcile(&id).wait().await;
    assert!(registry.has_sticky_error(&id));

    let config = Config::with_paths([sandbox.root.to_string_lossy().into_owned()]);
    registry
        .reload(&LocalDiscovery::from_config(&config).unwrap())
        .await
        .unwrap();
    assert!(!registry.has_sticky_error(&id));

    for dispatch in scheduler.refresh_all() {
        dispatch.wait().await;
    }
    let snapshot = registry.get(&id).unwrap();
    assert_eq!(snapshot.sync_state, SyncState::BehindAndAhead);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn test_status_probe_leaves_index_untouched() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    sandbox.commit(&local, "tracked.txt", "same\n");
    let index = local.join(".git").join("index");
    let before = std::fs::read(&index).unwrap();

    // Same content, newer timestamp: the cached stat data is now stale
    let file = std::fs::File::options()
        .write(true)
        .open(local.join("tracked.txt"))
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    drop(file);

    let output = GitCli::new().status(&local).await.unwrap();
    assert!(output.success, "{}", output.stderr);
    assert_eq!(std::fs::read(&index).unwrap(), before);
    assert!(!local.join(".git").join("index.lock").exists());
}

// Binary tests

fn gitifier(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_gitifier"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_cli_help() {
    let output = gitifier(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    for command in ["watch", "status", "sync", "list", "init", "doctor"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_missing_config_is_fatal() {
    let output = gitifier(&["--config", "/nonexistent/gitifier.yml", "status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration not found"), "{}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let sandbox = Sandbox::new();
    let config = sandbox.write_config("schedule:\n  fetch_interval: sometimes\n");

    let output = gitifier(&["--config", config.to_str().unwrap(), "list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid duration"), "{}", stderr);
}

#[test]
fn test_status_json() {
    let sandbox = Sandbox::new();
    sandbox.watched_clone("alpha");
    let local = sandbox.watched_clone("beta");
    sandbox.commit(&local, "local.txt", "local\n");
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "status", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let repos: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let repos = repos.as_array().unwrap();
    assert_eq!(repos.len(), 2);
    assert_eq!(repos[0]["name"], "alpha");
    assert_eq!(repos[0]["sync_state"], "clean");
    assert_eq!(repos[1]["name"], "beta");
    assert_eq!(repos[1]["sync_state"], "ahead");
    assert_eq!(repos[1]["indicator"], "push");
}

#[test]
fn test_sync_command_pulls() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let peer = sandbox.peer_clone("peer");
    let pushed = sandbox.advance_remote(&peer, "remote.txt", "remote\n");
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "sync", "alpha"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Pulled: 1"), "{}", stdout);
    assert_eq!(head(&local), pushed);
}

#[test]
fn test_sync_dry_run_changes_nothing() {
    let sandbox = Sandbox::new();
    let local = sandbox.watched_clone("alpha");
    let committed = sandbox.commit(&local, "local.txt", "local\n");
    let before = sandbox.remote_head();
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "sync", "--dry-run"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("alpha: would push"), "{}", stdout);
    assert_eq!(sandbox.remote_head(), before);
    assert_ne!(sandbox.remote_head(), committed);
}

#[test]
fn test_sync_unknown_repository() {
    let sandbox = Sandbox::new();
    sandbox.watched_clone("alpha");
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "sync", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no repository named nope"));
}

#[test]
fn test_list_json() {
    let sandbox = Sandbox::new();
    sandbox.watched_clone("alpha");
    std::fs::create_dir_all(sandbox.root.join("not-a-repo")).unwrap();
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "list", "--json"]);
    assert!(output.status.success());
    let repos: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(repos.as_array().unwrap().len(), 1);
    assert_eq!(repos[0]["name"], "alpha");
}

#[test]
fn test_doctor_command() {
    let sandbox = Sandbox::new();
    sandbox.watched_clone("alpha");
    let config = sandbox.write_config("");

    let output = gitifier(&["--config", config.to_str().unwrap(), "doctor"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("System Diagnostics"));
    assert!(stdout.contains("Git"));
    assert!(stdout.contains("All checks passed"), "{}", stdout);
}

#[test]
fn test_init_writes_config() {
    let sandbox = Sandbox::new();
    let xdg = sandbox.temp_dir.path().join("xdg");
    let root = sandbox.temp_dir.path().join("new-root");

    let output = Command::new(env!("CARGO_BIN_EXE_gitifier"))
        .args(["init", "--path", root.to_str().unwrap()])
        .env("XDG_CONFIG_HOME", &xdg)
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("initialized"));
    assert!(root.is_dir());

    let config = Config::load(&xdg.join("gitifier").join("config.yml")).unwrap();
    assert_eq!(config.root_paths(), vec![root]);
}
