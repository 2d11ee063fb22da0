use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use gitifier::config::LoggingConfig;
use gitifier::health::CheckResult;
use gitifier::scheduler::summarize;
use gitifier::{
    Config, Daemon, DaemonHandle, GitBackend, GitCli, HealthCheck, LocalDiscovery, RepoEvent,
    RepoRegistry, RepoSnapshot, Resolved, Scheduler, SyncState,
};

#[derive(Parser)]
#[command(name = "gitifier")]
#[command(about = "Keeps local git working copies in sync with their remotes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to ./gitifier.yml, then the XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch repositories in the foreground (default)
    Watch,

    /// Probe every repository once and print its state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Fetch and reconcile once
    Sync {
        /// Only report what would be done, using the last fetched remote state
        #[arg(long)]
        dry_run: bool,

        /// Repository name or path (all repositories when omitted)
        repo: Option<String>,
    },

    /// List discovered repositories
    List {
        /// Print JSON instead of a list
        #[arg(long)]
        json: bool,
    },

    /// Write a configuration file
    Init {
        /// Root directory to scan; repeat for several
        #[arg(short, long = "path", default_value = "~/dev")]
        paths: Vec<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let explicit = cli.config.as_deref();

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Init { paths, force } => {
            init_logging(&LoggingConfig::default(), cli.verbose)?;
            cmd_init(paths, force).await
        }
        Commands::Doctor => {
            init_logging(&LoggingConfig::default(), cli.verbose)?;
            cmd_doctor(explicit).await
        }
        Commands::Watch => {
            let (config, path) = load_config(explicit, cli.verbose)?;
            cmd_watch(config, path).await
        }
        Commands::Status { json } => {
            let (config, _) = load_config(explicit, cli.verbose)?;
            cmd_status(&config, json).await
        }
        Commands::Sync { dry_run, repo } => {
            let (config, _) = load_config(explicit, cli.verbose)?;
            cmd_sync(&config, dry_run, repo).await
        }
        Commands::List { json } => {
            let (config, _) = load_config(explicit, cli.verbose)?;
            cmd_list(&config, json).await
        }
    }
}

/// Locate and load configuration, then start logging with its settings
fn load_config(explicit: Option<&Path>, verbose: bool) -> Result<(Config, PathBuf)> {
    let (config, path) = Config::discover(explicit)?;
    init_logging(&config.logging, verbose)?;
    info!("Starting gitifier v{}", env!("CARGO_PKG_VERSION"));
    info!("Using configuration {}", path.display());
    Ok((config, path))
}

/// Initialize logging from configuration; `--verbose` and `RUST_LOG` take precedence
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    // stdout carries command output
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match logging.format.as_str() {
        "pretty" => layer.pretty().boxed(),
        "full" => layer.boxed(),
        _ => layer.compact().boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(())
}

fn git_backend() -> Arc<dyn GitBackend> {
    Arc::new(GitCli::new())
}

/// Discover repositories and wire a scheduler over them
async fn load_collection(config: &Config) -> Result<Arc<Scheduler>> {
    let registry = Arc::new(RepoRegistry::new());
    let discovery = LocalDiscovery::from_config(config)?;
    registry.reload(&discovery).await?;
    Ok(Arc::new(Scheduler::from_config(
        config,
        registry,
        git_backend(),
    )?))
}

/// Write a configuration file to the XDG location
async fn cmd_init(paths: Vec<String>, force: bool) -> Result<()> {
    info!("Initializing gitifier...");

    let config_path = Config::default_config_path()?;
    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    let config = Config::with_paths(paths);

    // Check the roots the way they will be read back
    let mut expanded = config.clone();
    expanded.expand_paths()?;
    for root in expanded.root_paths() {
        if !root.is_dir() {
            std::fs::create_dir_all(&root)?;
            info!("Created root directory {}", root.display());
        }
    }

    config.save(&config_path)?;
    info!("Configuration saved to: {:?}", config_path);

    println!("✅ gitifier initialized successfully!");
    println!("   Config: {}", config_path.display());
    for root in expanded.root_paths() {
        println!("   Root: {}", root.display());
    }
    println!("   Next: run 'gitifier status' or 'gitifier watch'");

    Ok(())
}

/// Run the daemon in the foreground, echoing state changes and reading commands from stdin
async fn cmd_watch(config: Config, config_path: PathBuf) -> Result<()> {
    let mut daemon = Daemon::new(config, Some(config_path), git_backend())?;
    let handle = daemon.handle();

    println!("👀 Watching repositories (type 'help' for commands, Ctrl+C to stop)");

    tokio::spawn(print_events(handle.clone()));
    tokio::spawn(read_console(handle));

    daemon.run().await
}

async fn print_events(handle: DaemonHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(RepoEvent::Updated(snapshot)) => print_repo_line(&snapshot, 0),
            Ok(RepoEvent::Reloaded { count }) => println!("🔄 Watching {} repositories", count),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} state changes", skipped);
                // Catch up from the current state
                print_table(&handle.list_repos());
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Console commands accepted by `watch`
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Sync(Option<String>),
    Refresh,
    Reload,
    List,
    Help,
    Quit,
}

fn parse_console_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "sync" | "s" => ConsoleCommand::Sync(words.next().map(str::to_string)),
        "refresh" | "r" => ConsoleCommand::Refresh,
        "reload" => ConsoleCommand::Reload,
        "list" | "ls" | "l" => ConsoleCommand::List,
        "help" | "h" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => return None,
    };
    Some(command)
}

async fn read_console(handle: DaemonHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // EOF just stops the console; the daemon keeps running
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let Some(command) = parse_console_command(&line) else {
            println!("❓ Unknown command: {} (type 'help')", line.trim());
            continue;
        };

        let sent = match command {
            ConsoleCommand::Sync(Some(query)) => match handle.resolve(&query) {
                Resolved::Found(id) => handle.trigger_reconcile(id),
                Resolved::NotFound => {
                    println!("❓ No repository named {}", query);
                    Ok(())
                }
                Resolved::Ambiguous(ids) => {
                    println!("❓ {} matches several repositories; use a path:", query);
                    for id in ids {
                        println!("   {}", id);
                    }
                    Ok(())
                }
            },
            ConsoleCommand::Sync(None) => handle.trigger_reconcile_all(),
            ConsoleCommand::Refresh => handle.trigger_refresh_all(),
            ConsoleCommand::Reload => handle.trigger_reload(),
            ConsoleCommand::List => {
                print_table(&handle.list_repos());
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("Commands:");
                println!("  sync [NAME]  fetch and reconcile one or all repositories");
                println!("  refresh      probe every repository now");
                println!("  reload       re-read configuration and rediscover");
                println!("  list         show every repository");
                println!("  quit         stop watching");
                Ok(())
            }
            ConsoleCommand::Quit => {
                handle.shutdown();
                break;
            }
        };

        if let Err(e) = sent {
            warn!("{}", e);
            break;
        }
    }
}

/// Probe every repository once
async fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let scheduler = load_collection(config).await?;
    summarize(scheduler.refresh_all()).await;

    let repos = scheduler.registry().snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&repos)?);
    } else {
        print_table(&repos);
    }
    Ok(())
}

/// Fetch and reconcile once
async fn cmd_sync(config: &Config, dry_run: bool, repo: Option<String>) -> Result<()> {
    info!("Starting repository synchronization...");
    let scheduler = load_collection(config).await?;
    let registry = scheduler.registry().clone();

    let targets = match &repo {
        Some(query) => match registry.resolve(query) {
            Resolved::Found(id) => vec![id],
            Resolved::NotFound => bail!("no repository named {}", query),
            Resolved::Ambiguous(ids) => {
                let ids: Vec<_> = ids.iter().map(ToString::to_string).collect();
                bail!("{} matches several repositories: {}", query, ids.join(", "))
            }
        },
        None => registry.ids(),
    };
    println!("🔍 Found {} repositories", targets.len());

    if dry_run {
        println!("\n🔍 Dry run mode - analyzing repository states");
        summarize(scheduler.refresh_all()).await;

        for snapshot in registry.snapshot() {
            if !targets.contains(&snapshot.id) {
                continue;
            }
            let plan = match snapshot.sync_state {
                SyncState::Behind => "would pull",
                SyncState::Ahead => "would push",
                SyncState::BehindAndAhead => "would pull, then push",
                SyncState::Dirty => "skipped: local changes",
                SyncState::Clean => "up to date",
                SyncState::Unknown => "skipped: could not be probed",
            };
            println!("   {} {}: {}", snapshot.indicator.symbol(), snapshot.name, plan);
        }
        return Ok(());
    }

    println!("\n🔄 Running repository synchronization");
    let dispatches = targets
        .iter()
        .map(|id| scheduler.fetch_and_reconcile(id))
        .collect();
    let summary = summarize(dispatches).await;

    println!("\n🎉 Synchronization Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   ⬇️  Pulled: {}", summary.pulled);
    println!("   ⬆️  Pushed: {}", summary.pushed);
    println!("   ✅ Up to date: {}", summary.up_to_date);
    println!("   ⏭️  Skipped: {}", summary.skipped);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed > 0 {
        println!("\n🔍 Failed repositories:");
        for snapshot in registry.snapshot() {
            if let Some(error) = &snapshot.last_error {
                println!("   ❌ {}: {}", snapshot.name, error);
            }
        }
    }

    Ok(())
}

/// List discovered repositories without probing them
async fn cmd_list(config: &Config, json: bool) -> Result<()> {
    let scheduler = load_collection(config).await?;
    let repos = scheduler.registry().snapshot();

    if json {
        let entries: Vec<_> = repos
            .iter()
            .map(|r| serde_json::json!({ "name": r.name, "path": r.path }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Repositories ({}):", repos.len());
    for repo in repos {
        println!("  📁 {}  {}", repo.name, repo.path.display());
    }
    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(config_path: Option<&Path>) -> Result<()> {
    let health = HealthCheck::run(config_path).await;
    print_health_report(&health);
    Ok(())
}

fn print_table(repos: &[RepoSnapshot]) {
    let width = repos.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for repo in repos {
        print_repo_line(repo, width);
    }
}

fn print_repo_line(repo: &RepoSnapshot, width: usize) {
    let mut line = format!(
        "{} {:<width$}  {}",
        repo.indicator.symbol(),
        repo.name,
        repo.sync_state,
        width = width
    );
    if let Some(error) = &repo.last_error {
        line.push_str(&format!("  ({})", error));
    }
    println!("{}", line);
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 gitifier System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
