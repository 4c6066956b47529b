use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use tabsync::db::{migrate, Db};
use tabsync::events::{self, EventBus};
use tabsync::ledger::Ledger;
use tabsync::sync::SqliteStore;
use tabsync::{watch, Config, Coordinator, TabsyncError};
use tokio::sync::watch as signal;

fn init_logger(config: &Config) {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.pipeline.log_level.as_str())
    ).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("watch");

    // Startup fails here if the watch directory is unusable
    let config = Config::load()?;
    init_logger(&config);

    match command {
        "verify" => run_schema_verification(&config).await?,
        "watch" => run_pipeline(config).await?,
        other => {
            anyhow::bail!("unknown command '{}': expected 'watch' or 'verify'", other);
        }
    }

    Ok(())
}

/// Watch the drop folder until Ctrl-C, then drain and exit.
async fn run_pipeline(config: Config) -> Result<()> {
    log::info!("Starting tabsync v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Watch dir: {} (pattern '{}')", config.watch_dir().display(), config.pipeline.pattern);
    log::info!("Database path: {}", config.db_path().display());
    log::info!("Target table: {}", config.schema.table);

    let db = Db::new(config.db_path());
    db.migrate(config.migrations_dir()).await?;
    log::info!("Database initialized");

    let ledger = Ledger::new(db.clone(), config.claim_timeout());
    let store = Arc::new(SqliteStore::new(db));
    let bus = EventBus::new();
    let subscribers = events::spawn_configured(&config.notifications, &bus)?;
    let coordinator = Coordinator::new(&config, ledger.clone(), store, bus)?;

    let pattern = config.file_pattern()?;
    // Subscribe to changes first so nothing written during the rescan is missed
    let live = watch::watch(config.watch_dir(), &pattern, &config.detector, config.pipeline.recursive)?;
    let backlog = if config.detector.rescan_on_start {
        watch::rescan(config.watch_dir(), &pattern, config.pipeline.recursive, &ledger).await?
    } else {
        Vec::new()
    };
    let events = futures_util::stream::iter(backlog).chain(live);

    let (stop_tx, stop_rx) = signal::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl-C, stopping"),
            Err(e) => log::error!("Cannot listen for Ctrl-C: {}", e),
        }
        let _ = stop_tx.send(true);
    });

    let summary = coordinator.run(events, stop_rx).await;
    drop(coordinator);

    // Pumps end once the bus is gone; give slow webhooks a moment
    for handle in subscribers {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.is_err() {
            log::warn!("A notification subscriber did not finish in time");
        }
    }

    log::info!(
        "tabsync stopped: {} synced, {} already committed, {} failed",
        summary.synced,
        summary.already_committed,
        summary.failed
    );
    Ok(())
}

/// Run database schema verification
async fn run_schema_verification(config: &Config) -> Result<()> {
    log::info!("Starting tabsync v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Watch dir: {}", config.watch_dir().display());
    log::info!("Database path: {}", config.db_path().display());

    let schema = config.compiled_schema()?;
    log::info!("✓ Schema '{}' compiles ({} columns)", schema.table, schema.columns.len());

    let db = Db::new(config.db_path());
    db.migrate(config.migrations_dir()).await?;
    log::info!("Database initialized successfully");

    verify_database_schema(&db).await?;
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = ["ledger_entries", "records", "schema_migrations"];
        let mut all_tables_exist = true;
        for table in &expected_tables {
            if tables.iter().any(|t| t == table) {
                log::debug!("✓ Table exists: {}", table);
            } else {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            }
        }
        if !all_tables_exist {
            return Err(TabsyncError::Config("Not all required tables exist".to_string()));
        }

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for index_name in ["idx_ledger_status", "idx_records_hash"] {
            if indexes.iter().any(|i| i == index_name) {
                log::debug!("✓ Index exists: {}", index_name);
            } else {
                log::warn!("Index not found: {}", index_name);
            }
        }

        let applied = migrate::get_applied_migrations(conn)?;
        if applied.len() < 2 {
            return Err(TabsyncError::Config(format!("Expected at least 2 migrations, found {}", applied.len())));
        }
        log::debug!("✓ {} migrations applied", applied.len());

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(TabsyncError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let stuck: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_entries WHERE status = 'in_progress'",
            [],
            |row| row.get(0),
        )?;
        if stuck > 0 {
            log::warn!("{} ledger entries are in progress (run `ingest --force` if no pipeline is running)", stuck);
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(TabsyncError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    }).await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}
