//! Sync engine: owns the local and remote handles and runs both daemons.
//!
//! Constructed once at startup and shared through an `Arc`. The sync daemon
//! and forced syncs share a single-flight guard, so cycles never overlap.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::LocalDb;
use crate::error::StoreError;
use crate::model::now_ts;
use crate::purge::{self, PurgeReport};
use crate::remote::RemoteStore;
use crate::sync::{self, CycleReport, PhaseCell, SyncPhase};

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_online: bool,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub pending_sessions: i64,
    pub pending_operators: i64,
    pub pending_locations: i64,
    pub cycles: u64,
}

#[derive(Debug, Default)]
struct LastOutcome {
    last_sync_at: Option<String>,
    last_error: Option<String>,
}

pub struct SyncEngine {
    local: Arc<LocalDb>,
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    config: EngineConfig,
    cycle_guard: tokio::sync::Mutex<()>,
    phase: PhaseCell,
    is_online: AtomicBool,
    cycles: AtomicU64,
    outcome: Mutex<LastOutcome>,
    sync_running: AtomicBool,
    purge_running: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine. `remote` may be `None`: the engine then runs offline
    /// until a store is attached.
    pub fn configure(
        local: Arc<LocalDb>,
        remote: Option<Arc<dyn RemoteStore>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        info!(
            driver = remote.as_ref().map(|r| r.name()).unwrap_or("offline"),
            interval_secs = config.sync_interval.as_secs(),
            batch = config.sync_batch_size,
            "Sync engine configured"
        );
        Arc::new(Self {
            local,
            remote: RwLock::new(remote),
            config,
            cycle_guard: tokio::sync::Mutex::new(()),
            phase: PhaseCell::default(),
            is_online: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            outcome: Mutex::new(LastOutcome::default()),
            sync_running: AtomicBool::new(false),
            purge_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local(&self) -> &Arc<LocalDb> {
        &self.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Swap the remote store at runtime. `None` takes the engine offline.
    pub fn attach_remote(&self, remote: Option<Arc<dyn RemoteStore>>) {
        let driver = remote.as_ref().map(|r| r.name());
        if remote.is_none() {
            self.is_online.store(false, Ordering::SeqCst);
        }
        match self.remote.write() {
            Ok(mut slot) => *slot = remote,
            Err(poisoned) => *poisoned.into_inner() = remote,
        }
        info!(driver = driver.unwrap_or("offline"), "Remote store attached");
    }

    fn current_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        match self.remote.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    // -----------------------------------------------------------------------
    // Daemons
    // -----------------------------------------------------------------------

    /// Start the sync timer loop. Returns `false` if it is already running or
    /// the engine has been shut down.
    pub fn start_sync_daemon(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.sync_running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let engine = Arc::clone(self);
        let interval = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            info!("Sync daemon started (interval: {}s)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let report = engine.run_sync_cycle().await;
                if report.sessions_synced > 0 {
                    info!(synced = report.sessions_synced, "Sync cycle complete");
                }
            }
            engine.sync_running.store(false, Ordering::SeqCst);
            info!("Sync daemon stopped");
        });
        self.track(handle);
        true
    }

    /// Start the purge timer loop; the first purge runs immediately.
    pub fn start_purge_daemon(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.purge_running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let engine = Arc::clone(self);
        let interval = self.config.purge_interval;
        let handle = tokio::spawn(async move {
            info!("Purge daemon started (interval: {}s)", interval.as_secs());
            loop {
                engine.run_purge_cycle().await;
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            engine.purge_running.store(false, Ordering::SeqCst);
            info!("Purge daemon stopped");
        });
        self.track(handle);
        true
    }

    pub fn is_sync_running(&self) -> bool {
        self.sync_running.load(Ordering::SeqCst)
    }

    pub fn is_purge_running(&self) -> bool {
        self.purge_running.load(Ordering::SeqCst)
    }

    /// Stop both loops. A cycle already in progress finishes first, so no
    /// remote transaction is abandoned midway.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Daemon task ended abnormally");
            }
        }
        info!("Sync engine shut down");
    }

    // -----------------------------------------------------------------------
    // Cycles
    // -----------------------------------------------------------------------

    /// Run one sync cycle now. Returns a skipped report if another cycle is
    /// still in progress.
    pub async fn run_sync_cycle(&self) -> CycleReport {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            debug!("Sync cycle already in progress; skipping");
            return CycleReport::skipped();
        };

        let remote = self.current_remote();
        let report = sync::run_cycle(
            &self.local,
            remote.as_deref(),
            self.config.sync_batch_size,
            &self.phase,
        )
        .await;

        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.is_online
            .store(remote.is_some() && !report.offline, Ordering::SeqCst);
        let mut outcome = match self.outcome.lock() {
            Ok(o) => o,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !report.offline && report.errors.is_empty() {
            outcome.last_sync_at = Some(now_ts());
            outcome.last_error = None;
        } else if let Some(err) = report.errors.last() {
            outcome.last_error = Some(err.clone());
        }
        drop(outcome);

        report
    }

    /// Run one purge cycle now, off the async worker threads.
    pub async fn run_purge_cycle(&self) -> PurgeReport {
        let local = Arc::clone(&self.local);
        let retention = self.config.retention_chrono();
        match tokio::task::spawn_blocking(move || purge::run_purge(&local, retention)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Purge task failed");
                PurgeReport {
                    failures: vec![e.to_string()],
                    ..Default::default()
                }
            }
        }
    }

    pub fn status(&self) -> Result<SyncStatus, StoreError> {
        let pending = sync::pending_counts(&self.local)?;
        let (last_sync_at, last_error) = match self.outcome.lock() {
            Ok(o) => (o.last_sync_at.clone(), o.last_error.clone()),
            Err(poisoned) => {
                let o = poisoned.into_inner();
                (o.last_sync_at.clone(), o.last_error.clone())
            }
        };
        Ok(SyncStatus {
            phase: self.phase.get(),
            is_online: self.is_online.load(Ordering::SeqCst),
            last_sync_at,
            last_error,
            pending_sessions: pending.sessions,
            pending_operators: pending.operators,
            pending_locations: pending.locations,
            cycles: self.cycles.load(Ordering::SeqCst),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
