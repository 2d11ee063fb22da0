//! Daemon - the long-running engine behind `gitifier watch`
//!
//! Owns the registry and scheduler, drives the refresh and fetch ticks, and
//! serves commands from presentation adapters through a [`DaemonHandle`].

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Intervals};
use crate::discovery::LocalDiscovery;
use crate::git::GitBackend;
use crate::registry::{RepoEvent, RepoRegistry, Resolved};
use crate::scheduler::Scheduler;
use crate::state::{RepoId, RepoSnapshot};

/// Requests accepted by the daemon loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconcile one repository now, clearing any error first
    Reconcile(RepoId),
    /// Fetch and reconcile every repository
    ReconcileAll,
    /// Probe every repository
    RefreshAll,
    /// Re-read configuration and re-run discovery
    Reload,
}

/// Cloneable control surface for presentation adapters
#[derive(Clone)]
pub struct DaemonHandle {
    registry: Arc<RepoRegistry>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
}

impl DaemonHandle {
    /// Snapshot of every repository, ordered by name
    pub fn list_repos(&self) -> Vec<RepoSnapshot> {
        self.registry.snapshot()
    }

    pub fn resolve(&self, query: &str) -> Resolved {
        self.registry.resolve(query)
    }

    pub fn trigger_reconcile(&self, id: RepoId) -> Result<()> {
        self.send(Command::Reconcile(id))
    }

    pub fn trigger_reconcile_all(&self) -> Result<()> {
        self.send(Command::ReconcileAll)
    }

    pub fn trigger_refresh_all(&self) -> Result<()> {
        self.send(Command::RefreshAll)
    }

    pub fn trigger_reload(&self) -> Result<()> {
        self.send(Command::Reload)
    }

    /// State-change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.registry.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        // No receiver means the loop is already gone
        let _ = self.shutdown.send(());
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("daemon is not running"))
    }
}

/// Daemon state and control
pub struct Daemon {
    config: Config,
    config_path: Option<PathBuf>,
    registry: Arc<RepoRegistry>,
    scheduler: Arc<Scheduler>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: DaemonHandle,
}

impl Daemon {
    /// Create a daemon; `config_path` is re-read on reload when given
    pub fn new(config: Config, config_path: Option<PathBuf>, git: Arc<dyn GitBackend>) -> Result<Self> {
        let registry = Arc::new(RepoRegistry::new());
        let scheduler = Scheduler::from_config(&config, registry.clone(), git)
            .context("Invalid scheduler configuration")?;

        let (command_sender, commands) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let handle = DaemonHandle {
            registry: registry.clone(),
            commands: command_sender,
            shutdown,
            is_running: Arc::new(AtomicBool::new(false)),
        };

        Ok(Self {
            config,
            config_path,
            registry,
            scheduler: Arc::new(scheduler),
            commands,
            handle,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run in the foreground until shutdown
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting gitifier daemon");
        self.handle.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.handle.shutdown.subscribe();

        let handle = self.handle.clone();
        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            handle.shutdown();
        });

        #[cfg(unix)]
        Self::spawn_reload_on_hangup(self.handle.clone());

        self.discover().await?;

        let result = self.daemon_loop(shutdown_receiver).await;
        self.handle.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn daemon_loop(&mut self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let mut intervals = self.config.intervals()?;
        let (mut refresh_timer, mut fetch_timer) = timers(&intervals).await;

        info!(
            "Daemon loop started (refresh every {:?}, fetch every {:?})",
            intervals.refresh, intervals.fetch
        );

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = refresh_timer.tick() => {
                    self.scheduler.refresh_tick();
                }

                _ = fetch_timer.tick() => {
                    self.scheduler.fetch_tick();
                }

                command = self.commands.recv() => {
                    // The daemon keeps a sender in its own handle, so this never closes
                    let Some(command) = command else { break };
                    debug!("Command: {:?}", command);

                    match command {
                        Command::Reconcile(id) => {
                            self.scheduler.trigger_reconcile(&id);
                        }
                        Command::ReconcileAll => {
                            self.scheduler.reconcile_all();
                        }
                        Command::RefreshAll => {
                            self.scheduler.refresh_all();
                        }
                        Command::Reload => {
                            if let Err(e) = self.reload().await {
                                error!("Reload failed: {:#}", e);
                            }
                            let updated = self.config.intervals()?;
                            if updated != intervals {
                                info!("Applying new intervals {:?}", updated);
                                intervals = updated;
                                (refresh_timer, fetch_timer) = timers(&intervals).await;
                            }
                        }
                    }
                }
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    /// Re-read configuration (keeping the old one if it is now broken) and
    /// re-run discovery
    async fn reload(&mut self) -> Result<()> {
        if let Some(path) = &self.config_path {
            match Config::load(path) {
                Ok(config) => self.config = config,
                Err(e) => warn!("Keeping previous configuration: {}", e),
            }
        }

        self.scheduler.set_auto_sync(self.config.sync.auto_sync);
        self.discover().await
    }

    async fn discover(&self) -> Result<()> {
        let discovery = LocalDiscovery::from_config(&self.config)?;
        let count = self
            .registry
            .reload(&discovery)
            .await
            .context("Repository discovery failed")?;
        info!("Watching {} repositories", count);

        self.scheduler.refresh_all();
        Ok(())
    }

    /// Wait for Ctrl+C
    async fn wait_for_shutdown_signal() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        debug!("Ctrl+C received");
    }

    #[cfg(unix)]
    fn spawn_reload_on_hangup(handle: DaemonHandle) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Unable to listen for SIGHUP: {}", e);
                return;
            }
        };
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading");
                if handle.trigger_reload().is_err() {
                    break;
                }
            }
        });
    }
}

/// Tick timers; the first tick is consumed so work starts one period in
async fn timers(intervals: &Intervals) -> (Interval, Interval) {
    let mut refresh = interval(intervals.refresh);
    let mut fetch = interval(intervals.fetch);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    fetch.set_missed_tick_behavior(MissedTickBehavior::Delay);
    refresh.tick().await;
    fetch.tick().await;
    (refresh, fetch)
}
