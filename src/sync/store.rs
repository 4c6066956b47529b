use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, ErrorCode};

use crate::db::Db;
use crate::error::{SyncError, TabsyncError};
use crate::ingest::IngestionBatch;

/// Destination for normalized rows.
///
/// Implementations must upsert by `(table_id, idempotency_key)`: writing the same
/// batch twice leaves exactly one copy of each row and is not an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Write the whole batch or nothing. Returns the number of rows acknowledged.
    async fn upsert_batch(&self, batch: &IngestionBatch) -> Result<usize, SyncError>;
}

/// Map a store-side error onto the retry taxonomy
pub fn classify(err: TabsyncError) -> SyncError {
    match err {
        TabsyncError::Database(e) => {
            let transient = matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy)
                    | Some(ErrorCode::DatabaseLocked)
                    | Some(ErrorCode::SystemIoFailure)
                    | Some(ErrorCode::CannotOpen)
            );
            if transient {
                SyncError::Transient(e.to_string())
            } else {
                SyncError::Fatal(e.to_string())
            }
        }
        TabsyncError::Io(e) => SyncError::Transient(e.to_string()),
        TabsyncError::Sync(e) => e,
        other => SyncError::Fatal(other.to_string()),
    }
}

/// SQLite-backed store writing into the `records` table
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Db,
}

struct RowWrite {
    key: String,
    row_index: i64,
    source_file: String,
    data_json: String,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Rows currently stored for one table
    pub async fn count_rows(&self, table_id: &str) -> crate::error::Result<u64> {
        let table_id = table_id.to_string();
        self.db
            .with_connection(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM records WHERE table_id = ?1",
                    params![table_id],
                    |r| r.get(0),
                )?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    /// Row counts per table, largest first
    pub async fn table_counts(&self) -> crate::error::Result<Vec<(String, u64)>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT table_id, COUNT(*) AS n FROM records GROUP BY table_id ORDER BY n DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64)))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_batch(&self, batch: &IngestionBatch) -> Result<usize, SyncError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let table_id = batch.table_id.clone();
        let content_hash = batch.content_hash.clone();
        let rows: Vec<RowWrite> = batch
            .keyed()
            .map(|(key, record)| RowWrite {
                key,
                row_index: record.provenance().row_index as i64,
                source_file: record.provenance().source_file.to_string_lossy().to_string(),
                data_json: record.to_json().to_string(),
            })
            .collect();

        self.db
            .with_connection(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO records (
                            table_id, idempotency_key, content_hash, source_file,
                            row_index, data_json, ingested_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                        ON CONFLICT(table_id, idempotency_key) DO UPDATE SET
                            source_file = excluded.source_file,
                            data_json = excluded.data_json,
                            ingested_at = excluded.ingested_at
                        "#,
                    )?;
                    for row in &rows {
                        stmt.execute(params![
                            table_id,
                            row.key,
                            content_hash,
                            row.source_file,
                            row.row_index,
                            row.data_json,
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(rows.len())
            })
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{NormalizedRecord, Provenance, Value};
    use crate::ledger::tests::setup_test_db;
    use std::path::PathBuf;

    fn batch(hash: &str, rows: usize) -> IngestionBatch {
        let records = (1..=rows)
            .map(|i| {
                NormalizedRecord::new(
                    vec![("product_id".to_string(), Value::String(format!("p{}", i)))],
                    Provenance {
                        source_file: PathBuf::from("drop/products.csv"),
                        row_index: i,
                    },
                )
            })
            .collect();
        IngestionBatch::new("products", hash, records)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (db, _temp_dir) = setup_test_db().await;
        let store = SqliteStore::new(db);

        assert_eq!(store.upsert_batch(&batch("h", 3)).await.unwrap(), 3);
        assert_eq!(store.upsert_batch(&batch("h", 3)).await.unwrap(), 3);
        assert_eq!(store.count_rows("products").await.unwrap(), 3);

        // A different file version is a different row-set
        store.upsert_batch(&batch("other", 2)).await.unwrap();
        assert_eq!(store.count_rows("products").await.unwrap(), 5);
        assert_eq!(store.table_counts().await.unwrap(), vec![("products".to_string(), 5)]);
    }

    #[tokio::test]
    async fn test_missing_table_is_fatal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::new(Db::new(temp_dir.path().join("empty.db")));
        let err = store.upsert_batch(&batch("h", 1)).await.unwrap_err();
        assert!(!err.is_transient(), "unexpected transient: {:?}", err);
    }

    #[test]
    fn test_classify_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None);
        assert!(classify(TabsyncError::Database(busy)).is_transient());
        let constraint =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT), None);
        assert!(!classify(TabsyncError::Database(constraint)).is_transient());
    }
}
