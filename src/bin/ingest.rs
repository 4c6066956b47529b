use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tabsync::db::Db;
use tabsync::events::{self, EventBus};
use tabsync::ingest::FileStamp;
use tabsync::ledger::Ledger;
use tabsync::sync::SqliteStore;
use tabsync::watch::{rescan, FileReadyEvent};
use tabsync::{Config, Coordinator};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Ingest every not-yet-committed file in the watch directory once, then exit")]
struct Args {
    /// Release in-progress claims left by a crashed run before ingesting.
    /// Only use when no other tabsync process is running.
    #[arg(short, long)]
    force: bool,

    /// Ingest only these files instead of scanning the watch directory
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    log::info!("Starting tabsync ingestion");

    let config = Config::load()?;
    log::info!("Configuration loaded successfully");
    log::info!("Watch dir: {}", config.watch_dir().display());
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    db.migrate(config.migrations_dir()).await?;
    log::info!("Database initialized");

    let ledger = Ledger::new(db.clone(), config.claim_timeout());
    if args.force {
        let released = ledger.release_all_in_progress().await?;
        log::info!("Released {} in-progress claim(s)", released);
    }

    let files: Vec<FileReadyEvent> = if args.files.is_empty() {
        let pattern = config.file_pattern()?;
        rescan(config.watch_dir(), &pattern, config.pipeline.recursive, &ledger).await?
    } else {
        let mut explicit = Vec::new();
        for path in &args.files {
            match FileStamp::of(path) {
                Some(stamp) => explicit.push(FileReadyEvent {
                    path: path.clone(),
                    size: stamp.size,
                    modified: stamp.modified,
                }),
                None => log::error!("✗ {}: not a readable file", path.display()),
            }
        }
        explicit
    };

    if files.is_empty() {
        log::info!("No new or modified files to process. Ingestion complete.");
        return Ok(());
    }
    log::info!("Processing {} file(s)", files.len());

    let store = Arc::new(SqliteStore::new(db));
    let bus = EventBus::new();
    let subscribers = events::spawn_configured(&config.notifications, &bus)?;
    let coordinator = Coordinator::new(&config, ledger.clone(), store.clone(), bus)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, releasing in-flight claims");
            let _ = stop_tx.send(true);
        }
    });

    let start = Instant::now();
    let summary = coordinator.run(futures_util::stream::iter(files), stop_rx).await;
    drop(coordinator);
    for handle in subscribers {
        let _ = handle.await;
    }

    let elapsed = start.elapsed();
    let rows = store.count_rows(&config.schema.table).await?;

    log::info!("==================================================");
    log::info!("Ingestion complete in {:?}", elapsed);
    log::info!("  Synced: {}", summary.synced);
    log::info!("  Already committed: {}", summary.already_committed);
    log::info!("  Failed: {}", summary.failed);
    if summary.abandoned > 0 {
        log::info!("  Abandoned: {}", summary.abandoned);
    }
    log::info!("  Rows in '{}': {}", config.schema.table, rows);
    log::info!("==================================================");

    if summary.failed > 0 {
        log::warn!("{} file(s) failed. Run `stats` for details.", summary.failed);
    }

    Ok(())
}
