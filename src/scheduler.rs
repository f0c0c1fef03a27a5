//! Continuous scheduler: sync on one interval, maintenance on another, never
//! both at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::state::{StateError, SyncStats};
use crate::sync::SyncEngine;
use crate::systemd::SystemdNotifier;

/// Mutual-exclusion gate shared by sync runs and maintenance.
///
/// Whoever holds the gate is the only writer of the state store.
#[derive(Debug, Default)]
pub struct SyncGate {
    lock: Mutex<()>,
    maintenance: AtomicBool,
}

/// Held for the duration of a maintenance cycle.
pub struct MaintenanceGuard<'a> {
    gate: &'a SyncGate,
    _permit: MutexGuard<'a, ()>,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.gate.maintenance.store(false, Ordering::SeqCst);
    }
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no maintenance or other sync holds the gate.
    pub async fn enter_sync(&self) -> MutexGuard<'_, ()> {
        if self.maintenance_in_progress() {
            tracing::info!("Maintenance in progress, sync waiting");
        }
        self.lock.lock().await
    }

    pub async fn enter_maintenance(&self) -> MaintenanceGuard<'_> {
        let permit = self.lock.lock().await;
        self.maintenance.store(true, Ordering::SeqCst);
        MaintenanceGuard {
            gate: self,
            _permit: permit,
        }
    }

    pub fn maintenance_in_progress(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    pub maintenance_interval: Duration,
    pub max_backups: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(24 * 3600),
            max_backups: 5,
        }
    }
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    systemd: SystemdNotifier,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Shares the engine's cancellation token with [`stop`](Self::stop).
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let cancel = engine.cancellation().clone();
        Self {
            engine,
            config,
            systemd: SystemdNotifier::new(false),
            cancel,
        }
    }

    pub fn with_systemd(mut self, systemd: SystemdNotifier) -> Self {
        self.systemd = systemd;
        self
    }

    /// Run exactly one sync cycle without starting timers.
    pub async fn run_single_cycle(&self) -> (bool, SyncStats) {
        let outcome = self.engine.run_once().await;
        (outcome.success, outcome.stats)
    }

    /// Statistics of the most recent sync run.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Request a cooperative stop.
    ///
    /// Timer waits return at once. A cycle in progress is not aborted
    /// mid-transfer: the transfer in flight completes and is recorded, then
    /// the cycle ends before starting the next item and reports
    /// `interrupted`. Remaining items are left for the next start.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Integrity check, recovery when needed, then a fresh backup.
    ///
    /// Runs under the gate. Fails only when the store cannot be trusted; a
    /// failed backup is logged.
    pub async fn run_maintenance(&self) -> Result<(), StateError> {
        let _guard = self.engine.gate().enter_maintenance().await;
        let store = self.engine.store();
        tracing::info!("Running state store maintenance");

        if !store.check_integrity().await {
            tracing::error!("State store failed integrity check, restoring from backup");
            let source = store.recover_from_backup().await?;
            tracing::warn!(backup = %source.display(), "State store restored");
        }

        match store.create_backup(self.config.max_backups).await {
            Ok(path) => tracing::debug!(backup = %path.display(), "Maintenance backup written"),
            Err(e) => tracing::warn!(error = %e, "Maintenance backup failed"),
        }
        Ok(())
    }

    /// Run sync and maintenance on their intervals until stopped.
    ///
    /// The first sync starts immediately; maintenance first runs one
    /// maintenance interval after start. Returns an error only when
    /// maintenance found the store unrecoverable, which also stops syncing.
    pub async fn run_forever(&self) -> Result<(), StateError> {
        self.systemd.notify_ready();
        tracing::info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            maintenance_interval_secs = self.config.maintenance_interval.as_secs(),
            "Scheduler started"
        );

        let sync_loop = async {
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.systemd.notify_watchdog();
                let (success, stats) = self.run_single_cycle().await;
                if !success {
                    tracing::warn!("Sync cycle did not succeed; continuing on schedule");
                }
                self.systemd.notify_status(&format!(
                    "Last sync: {} new, {} existing, {} errors",
                    stats.new_downloads, stats.already_exists, stats.errors
                ));

                tokio::select! {
                    _ = tokio::time::sleep(self.config.sync_interval) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
        };

        let maintenance_loop = async {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.maintenance_interval) => {}
                    _ = self.cancel.cancelled() => return Ok(()),
                }
                if let Err(e) = self.run_maintenance().await {
                    if e.is_fatal() {
                        tracing::error!(error = %e, "State store cannot be trusted, stopping");
                        self.cancel.cancel();
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "Maintenance failed");
                }
            }
        };

        let ((), result) = tokio::join!(sync_loop, maintenance_loop);
        self.systemd.notify_stopping();
        tracing::info!("Scheduler stopped");
        result
    }
}
