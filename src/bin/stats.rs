use tabsync::config::Config;
use tabsync::db::Db;
use tabsync::ledger::Ledger;
use tabsync::sync::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    let db = Db::new(config.db_path());
    let ledger = Ledger::new(db.clone(), config.claim_timeout());
    let store = SqliteStore::new(db);

    println!("\n=== tabsync Ledger Statistics ===\n");

    let stats = ledger.stats().await?;
    println!("{:-<60}", "");
    println!("{:<20} {:>12}", "Status", "Files");
    println!("{:-<60}", "");
    println!("{:<20} {:>12}", "committed", stats.committed);
    println!("{:<20} {:>12}", "in_progress", stats.in_progress);
    println!("{:<20} {:>12}", "failed", stats.failed);
    println!("{:-<60}", "");
    println!("Committed rows: {}\n", stats.committed_rows);

    let tables = store.table_counts().await?;
    if tables.is_empty() {
        println!("No rows stored yet.");
    } else {
        println!("Rows per table:\n");
        println!("{:-<60}", "");
        println!("{:<40} {:>12}", "Table", "Rows");
        println!("{:-<60}", "");
        for (table, rows) in &tables {
            println!("{:<40} {:>12}", table, rows);
        }
        println!("{:-<60}", "");
    }

    let failures = ledger.recent_failures(10).await?;
    if !failures.is_empty() {
        println!("\nRecent failures:\n");
        for entry in &failures {
            println!(
                "  {} {} (attempts: {})",
                entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
                entry.source_path.as_deref().unwrap_or("?"),
                entry.attempts
            );
            if let Some(error) = &entry.last_error {
                println!("      {}", error);
            }
        }
    }

    if stats.in_progress > 0 {
        println!(
            "\n{} file(s) in progress. If no pipeline is running, `ingest --force` releases them.",
            stats.in_progress
        );
    }

    println!();
    Ok(())
}
