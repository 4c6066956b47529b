//! Dedup & checksum ledger: which file versions (by content hash) have been synced.
//!
//! Every mutation runs inside a `BEGIN IMMEDIATE` transaction, so SQLite serializes
//! claims for the same hash across connections and processes. Entries live in the
//! `ledger_entries` table and therefore survive restarts.
//!
//! Lifecycle of one hash:
//!
//! ```text
//! (none) --claim--> in_progress --commit--> committed   (terminal, at most once)
//!                        |
//!                        +--release--> failed --claim--> in_progress
//! ```
//!
//! An `in_progress` entry older than the claim timeout may be taken over by a new claim.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use crate::db::Db;
use crate::error::{LedgerError, Result, TabsyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    InProgress,
    Committed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::InProgress => "in_progress",
            LedgerStatus::Committed => "committed",
            LedgerStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(LedgerStatus::InProgress),
            "committed" => Ok(LedgerStatus::Committed),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(LedgerError::UnknownStatus(other.to_string()).into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub content_hash: String,
    pub status: LedgerStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub row_count: Option<u64>,
    pub source_path: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Proof that the holder owns the in-progress claim on `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken {
    hash: String,
    claim_id: String,
}

impl ClaimToken {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn claim_id(&self) -> &str {
        &self.claim_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Proceed(ClaimToken),
    AlreadyCommitted { row_count: u64 },
    ClaimedByOther,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub in_progress: u64,
    pub committed: u64,
    pub failed: u64,
    pub committed_rows: u64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    db: Db,
    claim_timeout: Duration,
}

/// The ledger database was locked by another writer past the busy timeout.
pub fn is_contention(err: &TabsyncError) -> bool {
    match err {
        TabsyncError::Database(e) => matches!(
            e.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        ),
        _ => false,
    }
}

fn millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}

fn read_entry(conn: &Connection, hash: &str) -> Result<Option<LedgerEntry>> {
    let row = conn
        .query_row(
            "SELECT content_hash, status, claimed_at, updated_at, row_count, source_path, attempts, last_error \
             FROM ledger_entries WHERE content_hash = ?1",
            params![hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((content_hash, status, claimed_at, updated_at, row_count, source_path, attempts, last_error)) => {
            Ok(Some(LedgerEntry {
                content_hash,
                status: LedgerStatus::parse(&status)?,
                claimed_at: claimed_at.map(millis),
                updated_at: millis(updated_at),
                row_count: row_count.map(|n| n.max(0) as u64),
                source_path,
                attempts: attempts.max(0) as u32,
                last_error,
            }))
        }
    }
}

impl Ledger {
    pub fn new(db: Db, claim_timeout: Duration) -> Self {
        Self { db, claim_timeout }
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    /// Atomic compare-and-set: start an attempt on `hash` unless it is committed or
    /// actively held by someone else.
    pub async fn claim(&self, hash: &str, source: &Path) -> Result<ClaimOutcome> {
        let hash = hash.to_string();
        let source = source.to_string_lossy().to_string();
        let timeout_ms = self.claim_timeout.as_millis().min(i64::MAX as u128) as i64;

        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now().timestamp_millis();
                let existing = read_entry(&tx, &hash)?;

                let outcome = match existing {
                    Some(entry) if entry.status == LedgerStatus::Committed => ClaimOutcome::AlreadyCommitted {
                        row_count: entry.row_count.unwrap_or(0),
                    },
                    Some(entry) if entry.status == LedgerStatus::InProgress => {
                        let claimed_at = entry.claimed_at.map(|t| t.timestamp_millis()).unwrap_or(0);
                        if now - claimed_at < timeout_ms {
                            ClaimOutcome::ClaimedByOther
                        } else {
                            log::warn!(
                                "ledger: taking over stale claim on {} (held {} ms)",
                                hash,
                                now - claimed_at
                            );
                            ClaimOutcome::Proceed(Self::take_claim(&tx, &hash, &source, now, true)?)
                        }
                    }
                    Some(_) => ClaimOutcome::Proceed(Self::take_claim(&tx, &hash, &source, now, true)?),
                    None => ClaimOutcome::Proceed(Self::take_claim(&tx, &hash, &source, now, false)?),
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    fn take_claim(conn: &Connection, hash: &str, source: &str, now: i64, exists: bool) -> Result<ClaimToken> {
        let claim_id = uuid::Uuid::new_v4().to_string();
        if exists {
            conn.execute(
                "UPDATE ledger_entries SET status = 'in_progress', claim_token = ?2, claimed_at = ?3, \
                 updated_at = ?3, source_path = ?4, attempts = attempts + 1 WHERE content_hash = ?1",
                params![hash, claim_id, now, source],
            )?;
        } else {
            conn.execute(
                "INSERT INTO ledger_entries (content_hash, status, claim_token, claimed_at, updated_at, source_path, attempts) \
                 VALUES (?1, 'in_progress', ?2, ?3, ?3, ?4, 1)",
                params![hash, claim_id, now, source],
            )?;
        }
        Ok(ClaimToken {
            hash: hash.to_string(),
            claim_id,
        })
    }

    /// Mark the claimed hash committed. Fails with [`LedgerError::NotClaimed`] if the
    /// claim was taken over or already finished.
    pub async fn commit(&self, token: &ClaimToken, row_count: u64) -> Result<()> {
        let token = token.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now().timestamp_millis();
                let changed = tx.execute(
                    "UPDATE ledger_entries SET status = 'committed', claim_token = NULL, row_count = ?3, \
                     committed_at = ?4, updated_at = ?4, last_error = NULL \
                     WHERE content_hash = ?1 AND status = 'in_progress' AND claim_token = ?2",
                    params![token.hash, token.claim_id, row_count as i64, now],
                )?;
                if changed == 0 {
                    return Err(TabsyncError::Ledger(LedgerError::NotClaimed { hash: token.hash.clone() }));
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Give up a claim so a later attempt may retry. Returns false if the claim was
    /// no longer held (taken over or finished), in which case nothing changes.
    pub async fn release(&self, token: &ClaimToken, error: Option<&str>) -> Result<bool> {
        let token = token.clone();
        let error = error.map(|e| e.to_string());
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now().timestamp_millis();
                let changed = tx.execute(
                    "UPDATE ledger_entries SET status = 'failed', claim_token = NULL, updated_at = ?3, last_error = ?4 \
                     WHERE content_hash = ?1 AND status = 'in_progress' AND claim_token = ?2",
                    params![token.hash, token.claim_id, now, error],
                )?;
                tx.commit()?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn entry(&self, hash: &str) -> Result<Option<LedgerEntry>> {
        let hash = hash.to_string();
        self.db.with_connection(move |conn| read_entry(conn, &hash)).await
    }

    pub async fn status(&self, hash: &str) -> Result<Option<LedgerStatus>> {
        Ok(self.entry(hash).await?.map(|e| e.status))
    }

    pub async fn is_committed(&self, hash: &str) -> Result<bool> {
        Ok(self.status(hash).await? == Some(LedgerStatus::Committed))
    }

    /// Release every in-progress claim regardless of age. Only safe when no other
    /// process is ingesting (one-shot `ingest --force`).
    pub async fn release_all_in_progress(&self) -> Result<usize> {
        self.db
            .with_connection(|conn| {
                let now = Utc::now().timestamp_millis();
                let n = conn.execute(
                    "UPDATE ledger_entries SET status = 'failed', claim_token = NULL, updated_at = ?1, \
                     last_error = 'released by operator' WHERE status = 'in_progress'",
                    params![now],
                )?;
                Ok(n)
            })
            .await
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        self.db
            .with_connection(|conn| {
                let mut stats = LedgerStats::default();
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*), COALESCE(SUM(row_count), 0) FROM ledger_entries GROUP BY status",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let count = row.get::<_, i64>(1)?.max(0) as u64;
                    match LedgerStatus::parse(&status)? {
                        LedgerStatus::InProgress => stats.in_progress = count,
                        LedgerStatus::Committed => {
                            stats.committed = count;
                            stats.committed_rows = row.get::<_, i64>(2)?.max(0) as u64;
                        }
                        LedgerStatus::Failed => stats.failed = count,
                    }
                }
                Ok(stats)
            })
            .await
    }

    /// Most recently updated failed entries
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.db
            .with_connection(move |conn| {
                let hashes: Vec<String> = conn
                    .prepare(
                        "SELECT content_hash FROM ledger_entries WHERE status = 'failed' \
                         ORDER BY updated_at DESC LIMIT ?1",
                    )?
                    .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                let mut entries = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    if let Some(entry) = read_entry(conn, &hash)? {
                        entries.push(entry);
                    }
                }
                Ok(entries)
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub(crate) async fn setup_test_db() -> (Db, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let migrations_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.migrate(&migrations_dir).await.unwrap();
        (db, temp_dir)
    }

    fn src() -> &'static Path {
        Path::new("drop/products.csv")
    }

    #[tokio::test]
    async fn test_claim_commit_then_already_committed() {
        let (db, _temp_dir) = setup_test_db().await;
        let ledger = Ledger::new(db, Duration::from_secs(600));

        let token = match ledger.claim("h1", src()).await.unwrap() {
            ClaimOutcome::Proceed(t) => t,
            other => panic!("expected Proceed, got {:?}", other),
        };
        assert_eq!(ledger.status("h1").await.unwrap(), Some(LedgerStatus::InProgress));

        ledger.commit(&token, 3).await.unwrap();
        assert!(ledger.is_committed("h1").await.unwrap());
        assert_eq!(
            ledger.claim("h1", src()).await.unwrap(),
            ClaimOutcome::AlreadyCommitted { row_count: 3 }
        );

        // Committed at most once
        let err = ledger.commit(&token, 3).await.unwrap_err();
        assert!(matches!(err, TabsyncError::Ledger(LedgerError::NotClaimed { .. })));
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let (db, _temp_dir) = setup_test_db().await;
        let ledger = Ledger::new(db, Duration::from_secs(600));

        let ClaimOutcome::Proceed(token) = ledger.claim("h2", src()).await.unwrap() else {
            panic!("expected Proceed");
        };
        assert!(ledger.release(&token, Some("ErrEmpty")).await.unwrap());
        let entry = ledger.entry("h2").await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("ErrEmpty"));

        let ClaimOutcome::Proceed(second) = ledger.claim("h2", src()).await.unwrap() else {
            panic!("expected Proceed after release");
        };
        assert_ne!(second.claim_id(), token.claim_id());
        assert_eq!(ledger.entry("h2").await.unwrap().unwrap().attempts, 2);

        // Stale token can no longer release or commit
        assert!(!ledger.release(&token, None).await.unwrap());
        assert!(ledger.commit(&token, 1).await.is_err());
        ledger.commit(&second, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_claim_blocks_until_stale() {
        let (db, _temp_dir) = setup_test_db().await;
        let patient = Ledger::new(db.clone(), Duration::from_secs(600));
        let impatient = Ledger::new(db, Duration::ZERO);

        let ClaimOutcome::Proceed(first) = patient.claim("h3", src()).await.unwrap() else {
            panic!("expected Proceed");
        };
        assert_eq!(patient.claim("h3", src()).await.unwrap(), ClaimOutcome::ClaimedByOther);

        let ClaimOutcome::Proceed(taken) = impatient.claim("h3", src()).await.unwrap() else {
            panic!("stale claim should be reclaimable");
        };
        assert!(patient.commit(&first, 1).await.is_err());
        impatient.commit(&taken, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (db, _temp_dir) = setup_test_db().await;
        let ledger = Ledger::new(db, Duration::from_secs(600));

        let (a, b) = tokio::join!(ledger.claim("same", src()), ledger.claim("same", src()));
        let outcomes = [a.unwrap(), b.unwrap()];
        let proceeds = outcomes.iter().filter(|o| matches!(o, ClaimOutcome::Proceed(_))).count();
        let others = outcomes.iter().filter(|o| **o == ClaimOutcome::ClaimedByOther).count();
        assert_eq!(proceeds, 1);
        assert_eq!(others, 1);
    }

    #[tokio::test]
    async fn test_distinct_hashes_claim_independently() {
        let (db, _temp_dir) = setup_test_db().await;
        let ledger = Ledger::new(db, Duration::from_secs(600));

        let (a, b) = tokio::join!(ledger.claim("x", src()), ledger.claim("y", src()));
        assert!(matches!(a.unwrap(), ClaimOutcome::Proceed(_)));
        assert!(matches!(b.unwrap(), ClaimOutcome::Proceed(_)));
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let (db, _temp_dir) = setup_test_db().await;
        {
            let ledger = Ledger::new(db.clone(), Duration::from_secs(600));
            let ClaimOutcome::Proceed(token) = ledger.claim("durable", src()).await.unwrap() else {
                panic!("expected Proceed");
            };
            ledger.commit(&token, 7).await.unwrap();
        }
        let reopened = Ledger::new(Db::new(db.path()), Duration::from_secs(600));
        assert!(reopened.is_committed("durable").await.unwrap());
    }

    #[test]
    fn test_busy_and_locked_are_contention() {
        let sqlite = |code| TabsyncError::Database(rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None));
        assert!(is_contention(&sqlite(rusqlite::ffi::SQLITE_BUSY)));
        assert!(is_contention(&sqlite(rusqlite::ffi::SQLITE_LOCKED)));
        assert!(!is_contention(&sqlite(rusqlite::ffi::SQLITE_CORRUPT)));
        assert!(!is_contention(&TabsyncError::Database(rusqlite::Error::QueryReturnedNoRows)));
        assert!(!is_contention(&TabsyncError::Config("x".to_string())));
    }

    #[tokio::test]
    async fn test_stats_and_force_release() {
        let (db, _temp_dir) = setup_test_db().await;
        let ledger = Ledger::new(db, Duration::from_secs(600));

        let ClaimOutcome::Proceed(a) = ledger.claim("a", src()).await.unwrap() else { panic!() };
        ledger.commit(&a, 5).await.unwrap();
        let ClaimOutcome::Proceed(b) = ledger.claim("b", src()).await.unwrap() else { panic!() };
        ledger.release(&b, Some("boom")).await.unwrap();
        let ClaimOutcome::Proceed(_c) = ledger.claim("c", src()).await.unwrap() else { panic!() };

        let stats = ledger.stats().await.unwrap();
        assert_eq!(
            stats,
            LedgerStats {
                in_progress: 1,
                committed: 1,
                failed: 1,
                committed_rows: 5
            }
        );

        assert_eq!(ledger.release_all_in_progress().await.unwrap(), 1);
        assert_eq!(ledger.stats().await.unwrap().failed, 2);
        assert_eq!(ledger.recent_failures(10).await.unwrap().len(), 2);
    }
}
