use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "photomirror",
    version,
    about = "Incrementally mirror a photo catalog into a local directory",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the default `sync` command
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

impl Cli {
    /// The subcommand to run; bare invocation means `sync`.
    pub fn effective_command(self) -> Command {
        self.command.unwrap_or(Command::Sync(self.sync))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror the catalog (default)
    Sync(SyncArgs),
    /// Show what the state store tracks
    Status(StatusArgs),
    /// Remove a deletion record so the item is fetched again
    Forget(ForgetArgs),
    /// Check store integrity and report tracked files missing locally
    Verify(VerifyArgs),
}

/// Location of the state store and its companion files.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Directory holding the state store, backups, backoff sidecar and lock
    #[arg(long, env = "PHOTOMIRROR_STATE_DIR", default_value = "~/.photomirror")]
    pub state_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Catalog export directory (with `albums/` and `shared/` subdirectories)
    #[arg(short = 's', long, env = "PHOTOMIRROR_SOURCE")]
    pub source: Option<String>,

    /// Local directory the catalog is mirrored into
    #[arg(short = 'd', long, env = "PHOTOMIRROR_DIRECTORY")]
    pub directory: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Personal albums to include, comma-separated (default: all)
    #[arg(long)]
    pub albums: Option<String>,

    /// Shared albums to include, comma-separated (default: all)
    #[arg(long)]
    pub shared_albums: Option<String>,

    /// Maximum transfers per run (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_downloads: u64,

    /// Maximum bytes transferred per run (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_bytes: u64,

    /// Report what would happen without touching disk or state
    #[arg(long)]
    pub dry_run: bool,

    /// Run continuously, syncing every N seconds
    #[arg(long)]
    pub watch_interval: Option<u64>,

    /// Seconds between maintenance cycles in continuous mode
    #[arg(long, default_value_t = 86_400)]
    pub maintenance_interval: u64,

    /// Number of state store backups to keep
    #[arg(long, default_value_t = 5)]
    pub max_backups: usize,

    /// Initial backoff after throttling, in seconds
    #[arg(long, default_value_t = 30)]
    pub initial_delay: u64,

    /// Maximum backoff after repeated throttling, in seconds
    #[arg(long, default_value_t = 3600)]
    pub max_delay: u64,

    /// Seconds to wait for a verification code
    #[arg(long, default_value_t = 300)]
    pub step_up_timeout: u64,

    /// Max retries per transfer (0 = no retries)
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Count failed transfers against --max-downloads/--max-bytes
    #[arg(long)]
    pub count_failed_toward_limits: bool,

    /// Also skip items whose file name matches any deletion record
    #[arg(long)]
    pub match_deleted_names: bool,

    /// Do not take the instance lock
    #[arg(long)]
    pub allow_multiple: bool,

    /// Send readiness and watchdog notifications to systemd
    #[arg(long)]
    pub notify_systemd: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// List deletion records
    #[arg(long)]
    pub deleted: bool,
}

#[derive(Args, Debug)]
pub struct ForgetArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Item id of the deletion record to remove
    pub item_id: String,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Local mirror directory
    #[arg(short = 'd', long, env = "PHOTOMIRROR_DIRECTORY")]
    pub directory: String,
}
