//! photomirror: incrementally mirror a photo catalog into a local directory.
//!
//! Items already fetched or deliberately removed by the user are tracked in a
//! SQLite state store, so a file deleted locally is never downloaded again.

#![warn(clippy::all)]

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use photomirror::catalog::{DirectoryCatalog, TerminalStepUp};
use photomirror::cli::{self, Cli, Command};
use photomirror::config::{expand_tilde, Config, StatePaths};
use photomirror::lock::InstanceLock;
use photomirror::notify::LogNotifier;
use photomirror::scheduler::{Scheduler, SyncGate};
use photomirror::state::{SqliteStateStore, StateStore};
use photomirror::sync::SyncEngine;
use photomirror::systemd::SystemdNotifier;
use photomirror::shutdown;

fn no_store(path: &Path) -> bool {
    if path.exists() {
        return false;
    }
    println!("No state store found at {}", path.display());
    println!("Run a sync first to create it.");
    true
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = StatePaths::from_args(&args.store).store();
    if no_store(&db_path) {
        return Ok(());
    }

    let store = SqliteStateStore::open_read_only(&db_path).await?;
    let summary = store.summary().await?;

    println!("State store: {}", db_path.display());
    println!();
    println!("Downloaded: {} ({} bytes)", summary.downloads, summary.tracked_bytes);
    println!("Deleted:    {}", summary.deletions);
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if args.deleted && summary.deletions > 0 {
        println!();
        println!("Deleted items:");
        for record in store.list_deletions().await? {
            println!(
                "  {} ({}) - {}",
                record.item_name,
                record.item_id,
                record.deleted_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    Ok(())
}

/// Run the forget command.
async fn run_forget(args: cli::ForgetArgs) -> anyhow::Result<()> {
    let paths = StatePaths::from_args(&args.store);
    let db_path = paths.store();
    if no_store(&db_path) {
        return Ok(());
    }

    let store = SqliteStateStore::open(&db_path, 5).await?;
    if store.remove_deletion(&args.item_id).await? {
        println!("Forgot deletion of {}; it will be fetched on the next sync.", args.item_id);
    } else {
        println!("No deletion record for {}", args.item_id);
    }
    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let db_path = StatePaths::from_args(&args.store).store();
    if no_store(&db_path) {
        return Ok(());
    }

    let store = SqliteStateStore::open_read_only(&db_path).await?;
    let mut problems = 0;

    if !store.check_integrity().await {
        println!("CORRUPT: {}", db_path.display());
        problems += 1;
    }

    let root = expand_tilde(&args.directory);
    let downloads = store.list_downloads().await?;
    println!("Verifying {} tracked items under {}...", downloads.len(), root.display());
    println!();

    for record in store.detect_locally_missing(&root).await? {
        println!("MISSING: {} ({})", record.local_relative_path, record.item_id);
        problems += 1;
    }

    println!();
    if problems > 0 {
        println!("{} problem(s) found", problems);
        std::process::exit(1);
    }
    println!("All tracked items present");
    Ok(())
}

/// Run the sync command, once or continuously.
async fn run_sync(config: Config) -> anyhow::Result<()> {
    tracing::debug!(?config, "Effective configuration");

    // Only the engine may create the sync root.
    tokio::fs::create_dir_all(&config.paths.state_dir).await?;

    let mut lock = InstanceLock::new(config.paths.lock(), config.allow_multiple);
    if !lock.check_and_acquire()? {
        tracing::info!(
            lock = %lock.path().display(),
            "Another instance is already running, exiting"
        );
        return Ok(());
    }

    let result = sync_with_lock(&config).await;

    if let Err(e) = lock.release() {
        tracing::warn!(error = %e, "Failed to release instance lock");
    }
    result
}

async fn sync_with_lock(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn StateStore> =
        Arc::new(SqliteStateStore::open(&config.store_path(), config.max_backups).await?);
    let shutdown_token = shutdown::install_signal_handler()?;

    let catalog = Arc::new(DirectoryCatalog::new(config.source.clone()));
    let mut engine = SyncEngine::new(
        catalog,
        store,
        config.sync_config(),
        Arc::new(SyncGate::default()),
    )
    .with_notifier(Arc::new(LogNotifier))
    .with_cancellation(shutdown_token);
    if std::io::stdin().is_terminal() {
        engine = engine.with_step_up(Arc::new(TerminalStepUp::default()));
    }

    let scheduler = Scheduler::new(Arc::new(engine), config.scheduler_config())
        .with_systemd(SystemdNotifier::new(config.notify_systemd));

    if config.watch_interval.is_some() {
        scheduler.run_forever().await?;
        return Ok(());
    }

    let (success, stats) = scheduler.run_single_cycle().await;
    if stats.interrupted {
        tracing::info!("Sync interrupted by shutdown signal");
        return Ok(());
    }
    if !success {
        anyhow::bail!("Sync run failed ({} item error(s))", stats.errors);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.effective_command() {
        Command::Sync(args) => run_sync(Config::from_sync_args(args)?).await,
        Command::Status(args) => run_status(args).await,
        Command::Forget(args) => run_forget(args).await,
        Command::Verify(args) => run_verify(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photomirror::state::DownloadRecord;
    use std::fs;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("photomirror")
            .join("main_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sync_config(source: &Path, directory: &Path, state_dir: &Path) -> Config {
        let argv = vec![
            "photomirror".to_string(),
            "--source".to_string(),
            source.display().to_string(),
            "--directory".to_string(),
            directory.display().to_string(),
            "--state-dir".to_string(),
            state_dir.display().to_string(),
            "--max-retries".to_string(),
            "0".to_string(),
        ];
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.effective_command() {
            Command::Sync(args) => Config::from_sync_args(args).unwrap(),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmounted_root_keeps_tracked_history() {
        let dir = test_dir("unmounted_root");
        let source = dir.join("export");
        fs::create_dir_all(source.join("albums/Trips")).unwrap();
        fs::write(source.join("albums/Trips/a.jpg"), b"photo").unwrap();
        let state_dir = dir.join("state");
        let mirror = dir.join("unmounted").join("mirror");

        let config = sync_config(&source, &mirror, &state_dir);
        fs::create_dir_all(&state_dir).unwrap();
        {
            let store = SqliteStateStore::open(&config.store_path(), 5).await.unwrap();
            store
                .record_download(&DownloadRecord::new(
                    "albums/Trips/a.jpg",
                    "a.jpg",
                    "Trips",
                    "Trips/a.jpg",
                    5,
                ))
                .await
                .unwrap();
        }

        assert!(run_sync(config.clone()).await.is_err());
        assert!(!mirror.exists());

        let store = SqliteStateStore::open_read_only(&config.store_path())
            .await
            .unwrap();
        assert!(!store.is_deleted("albums/Trips/a.jpg").await.unwrap());
        assert_eq!(store.list_downloads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_root_is_created_by_first_sync() {
        let dir = test_dir("fresh_root");
        let source = dir.join("export");
        fs::create_dir_all(source.join("albums/Trips")).unwrap();
        fs::write(source.join("albums/Trips/a.jpg"), b"photo").unwrap();
        let mirror = dir.join("mirror");

        let config = sync_config(&source, &mirror, &dir.join("state"));
        run_sync(config).await.unwrap();
        assert!(mirror.join("Trips/a.jpg").exists());
    }
}
