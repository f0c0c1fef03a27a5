//! Sync orchestrator: reconciles the remote catalog, the local tree and the
//! tracked state for one run.
//!
//! Order within a run is fixed: authenticate, complete step-up if required,
//! scan the local tree, mark tracked-but-missing files deleted, and only then
//! evaluate the catalog. An item the user removed before this run is
//! therefore skipped even when the same listing still offers it.

mod delay;
mod paths;
mod scanner;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog::{AlbumFilters, ItemMetadata, PhotoCatalog, RemoteError, StepUpAuthenticator};
use crate::notify::{self, Notifier};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::scheduler::SyncGate;
use crate::state::{DownloadRecord, StateStore, SyncStats};

pub use delay::SyncDelay;
pub use paths::{clean_component, collection_name, local_relative_path};
pub use scanner::{scan, LocalInventory};

/// Engine settings, independent of how they were parsed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local directory the catalog is mirrored into.
    pub root: PathBuf,
    pub filters: AlbumFilters,
    /// Maximum transfers per run; 0 means unlimited.
    pub max_downloads: u64,
    /// Maximum bytes transferred per run; 0 means unlimited.
    pub max_bytes: u64,
    pub dry_run: bool,
    pub step_up_timeout: Duration,
    pub retry: RetryConfig,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Sidecar persisting the backoff delay; `None` keeps it in memory.
    pub delay_path: Option<PathBuf>,
    /// Whether failed transfers consume the count and byte budgets.
    pub count_failed_toward_limits: bool,
    /// Also skip items whose display name matches any deletion record.
    pub match_deleted_names: bool,
}

impl SyncConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filters: AlbumFilters::default(),
            max_downloads: 0,
            max_bytes: 0,
            dry_run: false,
            step_up_timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            delay_path: None,
            count_failed_toward_limits: false,
            match_deleted_names: false,
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// False if a precondition failed or any post-auth error occurred.
    pub success: bool,
    pub stats: SyncStats,
}

impl SyncOutcome {
    fn aborted() -> Self {
        Self {
            success: false,
            stats: SyncStats::default(),
        }
    }
}

/// Per-run transfer budget.
#[derive(Debug, Default)]
struct Budget {
    count: u64,
    bytes: u64,
}

impl Budget {
    fn admits(&self, config: &SyncConfig, size: u64) -> bool {
        if config.max_downloads > 0 && self.count >= config.max_downloads {
            return false;
        }
        if config.max_bytes > 0 && self.bytes.saturating_add(size) > config.max_bytes {
            return false;
        }
        true
    }

    fn consume(&mut self, size: u64) {
        self.count += 1;
        self.bytes = self.bytes.saturating_add(size);
    }
}

pub struct SyncEngine {
    catalog: Arc<dyn PhotoCatalog>,
    store: Arc<dyn StateStore>,
    config: SyncConfig,
    step_up: Option<Arc<dyn StepUpAuthenticator>>,
    notifier: Option<Arc<dyn Notifier>>,
    gate: Arc<SyncGate>,
    delay: Mutex<SyncDelay>,
    last_stats: Mutex<SyncStats>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<dyn PhotoCatalog>,
        store: Arc<dyn StateStore>,
        config: SyncConfig,
        gate: Arc<SyncGate>,
    ) -> Self {
        let delay = SyncDelay::load(
            config.delay_path.clone(),
            config.initial_delay,
            config.max_delay,
        );
        Self {
            catalog,
            store,
            config,
            step_up: None,
            notifier: None,
            gate,
            delay: Mutex::new(delay),
            last_stats: Mutex::new(SyncStats::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_step_up(mut self, step_up: Arc<dyn StepUpAuthenticator>) -> Self {
        self.step_up = Some(step_up);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use `token` for cooperative stop instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<SyncGate> {
        &self.gate
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request a cooperative stop: no new transfer starts after the current one.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Statistics of the most recent run.
    pub fn stats(&self) -> SyncStats {
        self.last_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current backoff delay.
    pub fn current_delay(&self) -> Duration {
        self.delay_state().current()
    }

    fn delay_state(&self) -> std::sync::MutexGuard<'_, SyncDelay> {
        self.delay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn notify(&self, message: &str, title: &str) {
        notify::send(self.notifier.as_deref(), message, title).await;
    }

    /// Run one sync pass while holding the gate.
    pub async fn run_once(&self) -> SyncOutcome {
        let _permit = self.gate.enter_sync().await;
        let outcome = self.run_locked().await;
        *self
            .last_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outcome.stats.clone();
        outcome
    }

    /// Authentication and step-up. Returns false when the run must abort.
    async fn establish_session(&self) -> bool {
        if let Err(e) = self.catalog.authenticate().await {
            tracing::error!(error = %e, "Authentication failed, skipping sync");
            return false;
        }

        if !self.catalog.requires_step_up().await {
            return true;
        }

        tracing::warn!("Remote service requires step-up authentication");
        self.notify(
            "The photo service is waiting for a verification code.",
            "Verification required",
        )
        .await;

        let Some(step_up) = &self.step_up else {
            tracing::error!("Step-up authentication required but no authenticator is configured");
            return false;
        };

        match tokio::time::timeout(
            self.config.step_up_timeout,
            step_up.verify(self.catalog.as_ref()),
        )
        .await
        {
            Ok(true) => {
                tracing::info!("Step-up authentication completed");
                true
            }
            Ok(false) => {
                tracing::error!("Step-up authentication was denied");
                false
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = self.config.step_up_timeout.as_secs(),
                    "Timed out waiting for step-up authentication"
                );
                false
            }
        }
    }

    async fn run_locked(&self) -> SyncOutcome {
        let config = &self.config;
        let root = &config.root;

        if !self.establish_session().await {
            return SyncOutcome::aborted();
        }

        let tracked = match self.store.list_downloads().await {
            Ok(tracked) => tracked,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read tracked downloads");
                return SyncOutcome::aborted();
            }
        };

        match tokio::fs::try_exists(root).await {
            Ok(true) => {}
            Ok(false) if !tracked.is_empty() => {
                tracing::error!(
                    root = %root.display(),
                    tracked = tracked.len(),
                    "Sync root is missing while downloads are tracked; refusing to mark them deleted"
                );
                return SyncOutcome::aborted();
            }
            Ok(false) => {
                if !config.dry_run {
                    if let Err(e) = tokio::fs::create_dir_all(root).await {
                        tracing::error!(root = %root.display(), error = %e, "Cannot create sync root");
                        return SyncOutcome::aborted();
                    }
                }
            }
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Cannot access sync root");
                return SyncOutcome::aborted();
            }
        }

        let inventory = match scanner::scan(root).await {
            Ok(inventory) => inventory,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Failed to scan sync root");
                return SyncOutcome::aborted();
            }
        };

        let mut stats = SyncStats::default();

        // Deletion detection completes before any catalog item is evaluated.
        let missing = match self.store.detect_locally_missing(root).await {
            Ok(missing) => missing,
            Err(e) => {
                tracing::error!(error = %e, "Failed to detect locally deleted files");
                return SyncOutcome::aborted();
            }
        };
        let mut deleted_this_run: HashSet<String> = HashSet::new();
        if !missing.is_empty() {
            if config.dry_run {
                for record in &missing {
                    tracing::info!(
                        item_id = %record.item_id,
                        path = %record.local_relative_path,
                        "[DRY RUN] Would mark as deleted"
                    );
                }
            } else {
                match self.store.mark_missing_as_deleted(&missing).await {
                    Ok(n) => tracing::info!(count = n, "Marked locally deleted files"),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to record local deletions");
                        return SyncOutcome::aborted();
                    }
                }
            }
            stats.marked_deleted = missing.len() as u64;
            deleted_this_run.extend(missing.iter().map(|r| r.item_id.clone()));
        }

        let mut tracked_paths: HashSet<String> = tracked
            .values()
            .filter(|r| !deleted_this_run.contains(&r.item_id))
            .map(|r| r.local_relative_path.clone())
            .collect();

        let run_id = if config.dry_run {
            None
        } else {
            match self.store.start_sync_run().await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to record sync run start");
                    None
                }
            }
        };

        let mut throttled = false;
        match self.catalog.list_items(&config.filters).await {
            Ok(items) => {
                tracing::info!(
                    items = items.len(),
                    local_files = inventory.file_count(),
                    "Fetched catalog"
                );
                throttled = self
                    .process_items(&items, &inventory, &deleted_this_run, &mut tracked_paths, &mut stats)
                    .await;
            }
            Err(e) if e.is_throttle() => {
                tracing::warn!("Catalog listing throttled; retrying next cycle");
                self.escalate_delay();
                throttled = true;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list catalog");
                stats.errors += 1;
            }
        }

        if !throttled && stats.errors == 0 && !stats.interrupted {
            let mut delay = self.delay_state();
            if delay.reset() {
                tracing::info!(
                    delay_ms = delay.current().as_millis() as u64,
                    "Clean run, sync backoff reset"
                );
                if !config.dry_run {
                    delay.save();
                }
            }
        }

        if let Some(id) = run_id {
            if let Err(e) = self.store.complete_sync_run(id, &stats).await {
                tracing::warn!(error = %e, "Failed to record sync run completion");
            }
        }

        let prefix = if config.dry_run { "[DRY RUN] " } else { "" };
        tracing::info!(
            total = stats.total_items,
            new = stats.new_downloads,
            existing = stats.already_exists,
            skipped_deleted = stats.skipped_deleted,
            skipped_limit = stats.skipped_limit,
            marked_deleted = stats.marked_deleted,
            throttled = stats.throttled,
            bytes = stats.bytes_transferred,
            errors = stats.errors,
            interrupted = stats.interrupted,
            "{}Sync run complete",
            prefix
        );

        if stats.errors > 0 {
            self.notify(
                &format!("Sync finished with {} error(s).", stats.errors),
                "Sync errors",
            )
            .await;
        }

        SyncOutcome {
            success: stats.errors == 0,
            stats,
        }
    }

    /// Evaluate catalog items in order. Returns whether throttling occurred.
    async fn process_items(
        &self,
        items: &[ItemMetadata],
        inventory: &LocalInventory,
        deleted_this_run: &HashSet<String>,
        tracked_paths: &mut HashSet<String>,
        stats: &mut SyncStats,
    ) -> bool {
        let config = &self.config;
        let mut budget = Budget::default();
        let mut escalated = false;

        for item in items {
            if self.cancel.is_cancelled() {
                tracing::info!("Stop requested, leaving remaining items for the next run");
                stats.interrupted = true;
                break;
            }
            stats.total_items += 1;

            match self.is_skipped_as_deleted(item, deleted_this_run).await {
                Ok(true) => {
                    tracing::debug!(item_id = %item.id, "Skipping item deleted locally");
                    stats.skipped_deleted += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(item_id = %item.id, error = %e, "Deletion lookup failed");
                    stats.errors += 1;
                    continue;
                }
            }

            let relative = local_relative_path(item.kind, &item.album, &item.filename);
            let collection = collection_name(item.kind, &item.album);
            if tracked_paths.contains(&relative) {
                stats.already_exists += 1;
                continue;
            }

            if inventory.contains(&relative) {
                // Present on disk but untracked: adopt it so a later removal
                // is seen as a deletion.
                stats.already_exists += 1;
                if !config.dry_run {
                    let record = DownloadRecord::new(
                        &item.id,
                        &item.filename,
                        &collection,
                        &relative,
                        item.size,
                    );
                    if let Err(e) = self.store.record_download(&record).await {
                        tracing::error!(item_id = %item.id, error = %e, "Failed to adopt existing file");
                        stats.errors += 1;
                        continue;
                    }
                    tracing::debug!(item_id = %item.id, path = %relative, "Adopted existing file");
                }
                tracked_paths.insert(relative);
                continue;
            }

            if !budget.admits(config, item.size) {
                tracing::debug!(item_id = %item.id, "Transfer limit reached, skipping");
                stats.skipped_limit += 1;
                continue;
            }

            if config.dry_run {
                tracing::info!(item_id = %item.id, path = %relative, "[DRY RUN] Would download");
                budget.consume(item.size);
                stats.new_downloads += 1;
                stats.bytes_transferred += item.size;
                tracked_paths.insert(relative);
                continue;
            }

            let destination = config.root.join(&relative);
            let result = retry::retry_with_backoff(
                &config.retry,
                |e: &RemoteError| {
                    if e.is_retryable() {
                        RetryAction::Retry
                    } else {
                        RetryAction::Abort
                    }
                },
                || self.catalog.download(item, &destination),
            )
            .await;

            match result {
                Ok(()) => {
                    let record = DownloadRecord::new(
                        &item.id,
                        &item.filename,
                        &collection,
                        &relative,
                        item.size,
                    );
                    budget.consume(item.size);
                    if let Err(e) = self.store.record_download(&record).await {
                        // The file stays on disk and is adopted next run.
                        tracing::error!(item_id = %item.id, error = %e, "Failed to record download");
                        stats.errors += 1;
                        continue;
                    }
                    tracing::info!(item_id = %item.id, path = %relative, "Downloaded");
                    stats.new_downloads += 1;
                    stats.bytes_transferred += item.size;
                    tracked_paths.insert(relative);
                }
                Err(e) if e.is_throttle() => {
                    stats.throttled += 1;
                    let mut pause = if escalated {
                        self.current_delay()
                    } else {
                        escalated = true;
                        self.escalate_delay()
                    };
                    if let RemoteError::Throttled {
                        retry_after: Some(after),
                    } = e
                    {
                        pause = pause.max(after);
                    }
                    tracing::warn!(
                        item_id = %item.id,
                        pause_ms = pause.as_millis() as u64,
                        "Remote service throttled transfer, pausing"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = self.cancel.cancelled() => {
                            stats.interrupted = true;
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Transfer failed");
                    stats.errors += 1;
                    if config.count_failed_toward_limits {
                        budget.consume(item.size);
                    }
                }
            }
        }

        escalated
    }

    async fn is_skipped_as_deleted(
        &self,
        item: &ItemMetadata,
        deleted_this_run: &HashSet<String>,
    ) -> Result<bool, crate::state::StateError> {
        if deleted_this_run.contains(&item.id) || self.store.is_deleted(&item.id).await? {
            return Ok(true);
        }
        if self.config.match_deleted_names {
            return self.store.is_deleted_by_name(&item.filename).await;
        }
        Ok(false)
    }

    /// Double the backoff delay once and persist it outside dry-run.
    fn escalate_delay(&self) -> Duration {
        let mut delay = self.delay_state();
        let next = delay.escalate();
        if !self.config.dry_run {
            delay.save();
        }
        tracing::warn!(delay_ms = next.as_millis() as u64, "Sync backoff increased");
        next
    }
}
