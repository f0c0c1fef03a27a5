use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::catalog::AlbumFilters;
use crate::cli::{StoreArgs, SyncArgs};
use crate::retry::RetryConfig;
use crate::scheduler::SchedulerConfig;
use crate::sync::SyncConfig;

const STORE_FILE: &str = "photomirror.db";
const DELAY_FILE: &str = "sync-delay.json";
const LOCK_FILE: &str = "photomirror.lock";

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Split a comma-separated album list, trimming names and dropping empties.
pub fn parse_album_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Artifacts kept under the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub state_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn from_args(args: &StoreArgs) -> Self {
        Self::new(expand_tilde(&args.state_dir))
    }

    /// The relational store; backups live beside it as `<store>.bak.<ts>`.
    pub fn store(&self) -> PathBuf {
        self.state_dir.join(STORE_FILE)
    }

    pub fn delay_sidecar(&self) -> PathBuf {
        self.state_dir.join(DELAY_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }
}

/// Settings for the `sync` command.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub directory: PathBuf,
    pub paths: StatePaths,
    pub filters: AlbumFilters,

    pub watch_interval: Option<Duration>,
    pub maintenance_interval: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub step_up_timeout: Duration,

    pub max_downloads: u64,
    pub max_bytes: u64,
    pub max_backups: usize,
    pub retry: RetryConfig,

    pub dry_run: bool,
    pub count_failed_toward_limits: bool,
    pub match_deleted_names: bool,
    pub allow_multiple: bool,
    pub notify_systemd: bool,
}

fn required(value: Option<String>, flag: &str) -> anyhow::Result<PathBuf> {
    let value = value.with_context(|| format!("{} is required for syncing", flag))?;
    Ok(expand_tilde(&value))
}

fn positive_secs(secs: u64, flag: &str) -> anyhow::Result<Duration> {
    if secs == 0 {
        anyhow::bail!("{} must be greater than zero", flag);
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_sync_args(args: SyncArgs) -> anyhow::Result<Self> {
        let source = required(args.source, "--source")?;
        let directory = required(args.directory, "--directory")?;
        if source == directory {
            anyhow::bail!("--source and --directory must differ");
        }

        let watch_interval = args
            .watch_interval
            .map(|s| positive_secs(s, "--watch-interval"))
            .transpose()?;

        Ok(Self {
            source,
            directory,
            paths: StatePaths::from_args(&args.store),
            filters: AlbumFilters {
                personal: parse_album_list(args.albums.as_deref()),
                shared: parse_album_list(args.shared_albums.as_deref()),
            },
            watch_interval,
            maintenance_interval: positive_secs(args.maintenance_interval, "--maintenance-interval")?,
            initial_delay: positive_secs(args.initial_delay, "--initial-delay")?,
            max_delay: Duration::from_secs(args.max_delay),
            step_up_timeout: positive_secs(args.step_up_timeout, "--step-up-timeout")?,
            max_downloads: args.max_downloads,
            max_bytes: args.max_bytes,
            max_backups: args.max_backups.max(1),
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: Duration::from_secs(args.retry_delay),
                max_delay: Duration::from_secs(60),
            },
            dry_run: args.dry_run,
            count_failed_toward_limits: args.count_failed_toward_limits,
            match_deleted_names: args.match_deleted_names,
            allow_multiple: args.allow_multiple,
            notify_systemd: args.notify_systemd,
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            root: self.directory.clone(),
            filters: self.filters.clone(),
            max_downloads: self.max_downloads,
            max_bytes: self.max_bytes,
            dry_run: self.dry_run,
            step_up_timeout: self.step_up_timeout,
            retry: self.retry.clone(),
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            delay_path: Some(self.paths.delay_sidecar()),
            count_failed_toward_limits: self.count_failed_toward_limits,
            match_deleted_names: self.match_deleted_names,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sync_interval: self.watch_interval.unwrap_or(Duration::from_secs(3600)),
            maintenance_interval: self.maintenance_interval,
            max_backups: self.max_backups,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.paths.store()
    }
}
