use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use pf_admission::{AdmissionEngine, UsageRecorder};
use pf_core::catalog::TierCatalog;
use pf_core::config::Config;
use pf_core::store::StateDb;
use pf_core::types::UsageLog;
use pf_fabric::registry::NodeRegistry;
use pf_fabric::Fabric;

use crate::http::{self, AppState};
use crate::identity::StaticAuthStore;
use crate::scheduler::ProbeScheduler;
use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Usage persistence
// ---------------------------------------------------------------------------

/// Usage sink backed by the state store. Records are handed to a background
/// write so the admission release path never blocks on I/O.
pub struct SqliteUsageRecorder {
    db: Arc<StateDb>,
}

impl SqliteUsageRecorder {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self { db }
    }
}

impl UsageRecorder for SqliteUsageRecorder {
    fn record(&self, log: UsageLog) {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.append_usage(&log).await {
                warn!(error = %e, "failed to persist usage log");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Intervals
// ---------------------------------------------------------------------------

/// Cadence of the daemon's background loops.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// Admission sweeper (queue wakeup + account GC).
    pub sweep_secs: u64,
    /// Session liveness patrol.
    pub patrol_secs: u64,
    /// Scheduled-probe tick.
    pub scheduler_secs: u64,
}

impl DaemonIntervals {
    fn from_config(cfg: &Config) -> Self {
        Self {
            sweep_secs: cfg.admission.sweep_interval_secs,
            patrol_secs: cfg.fabric.heartbeat_interval_secs,
            scheduler_secs: cfg.scheduler.tick_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The probefleet control-plane daemon.
///
/// Owns the admission engine, the node fabric, and the HTTP surface; runs
/// the sweeper, liveness patrol, and probe scheduler until shutdown.
pub struct Daemon {
    state: Arc<AppState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create a daemon, opening (or creating) the state database from config.
    pub async fn new(cfg: Config) -> Result<Self> {
        let db = StateDb::new(&cfg.state.path)
            .await
            .context("failed to open state database")?;
        Self::with_db(cfg, Arc::new(db)).await
    }

    /// Create a daemon over an existing state database (tests use an
    /// in-memory one).
    pub async fn with_db(cfg: Config, db: Arc<StateDb>) -> Result<Self> {
        let catalog = Arc::new(TierCatalog::with_builtin_tiers());
        let registry = NodeRegistry::load(db.clone())
            .await
            .context("failed to load node registry")?;
        let fabric = Fabric::new(registry, cfg.fabric.clone());
        let engine = AdmissionEngine::new(
            cfg.admission.clone(),
            Arc::new(SqliteUsageRecorder::new(db.clone())),
        );
        let identity = StaticAuthStore::from_config(&cfg.auth).resolver(catalog.clone());
        let scheduler = ProbeScheduler::new(engine.clone(), fabric.dispatcher.clone());

        let intervals = DaemonIntervals::from_config(&cfg);
        let state = Arc::new(AppState {
            cfg,
            engine,
            fabric,
            identity,
            state_db: db,
            catalog,
            scheduler,
        });

        Ok(Self {
            state,
            intervals,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Handle for triggering shutdown from another task (e.g. ctrl-c).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Run on the configured address until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.state.cfg.daemon.host, self.state.cfg.daemon.port
        );
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run on a pre-bound listener until shutdown (blocking). Binding is the
    /// caller's problem, which lets tests use port 0.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = http::router(self.state.clone());
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "probefleet API listening");

        info!(
            sweep_secs = self.intervals.sweep_secs,
            patrol_secs = self.intervals.patrol_secs,
            scheduler_secs = self.intervals.scheduler_secs,
            "daemon starting background loops"
        );
        Self::run_loops(self.state.clone(), self.intervals.clone(), self.shutdown.clone()).await;

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    /// The background loop shared by every run mode.
    async fn run_loops(state: Arc<AppState>, intervals: DaemonIntervals, shutdown: ShutdownSignal) {
        let stale_after = Duration::from_secs(state.cfg.fabric.stale_after_secs());

        let mut sweep_interval =
            tokio::time::interval(Duration::from_secs(intervals.sweep_secs.max(1)));
        let mut patrol_interval =
            tokio::time::interval(Duration::from_secs(intervals.patrol_secs.max(1)));
        let mut scheduler_interval =
            tokio::time::interval(Duration::from_secs(intervals.scheduler_secs.max(1)));

        // Consume the first immediate tick so loops don't all fire at t=0.
        sweep_interval.tick().await;
        patrol_interval.tick().await;
        scheduler_interval.tick().await;

        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    state.engine.sweep();
                }
                _ = patrol_interval.tick() => {
                    let stale = state.fabric.sessions.close_stale(stale_after);
                    if !stale.is_empty() {
                        warn!(count = stale.len(), "liveness patrol closed stale sessions");
                    }
                }
                _ = scheduler_interval.tick() => {
                    let fired = state.scheduler.tick();
                    if fired > 0 {
                        debug!(fired, "scheduler dispatched due probes");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }
}
