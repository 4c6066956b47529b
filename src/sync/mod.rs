//! Sync writer: batches normalized records and upserts them with retry.
//!
//! Transient store errors are retried with capped exponential backoff up to the
//! configured attempt count; fatal errors are returned immediately. A file is only
//! acknowledged once every batch has been acknowledged by the store.

pub mod batcher;
pub mod retry;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ingest::{IngestionBatch, NormalizedRecord};

pub use batcher::Batcher;
pub use retry::{RetryPolicy, RetryState};
pub use store::{SqliteStore, Store};

/// Store acknowledgment for one or more batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    pub rows_written: usize,
    pub batches: usize,
    /// Store calls made, including retries
    pub attempts: u32,
}

/// Progress callback: receives the attempt number each time a batch write starts.
pub type AttemptObserver<'a> = &'a (dyn Fn(u32) + Send + Sync);

pub struct SyncWriter {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    batcher: Batcher,
}

impl SyncWriter {
    pub fn new(store: Arc<dyn Store>, config: &SyncConfig) -> Self {
        Self {
            store,
            policy: RetryPolicy::from_config(config),
            batcher: Batcher::new(config.batch_size, Duration::from_millis(config.batch_max_wait_ms)),
        }
    }

    pub fn with_policy(store: Arc<dyn Store>, policy: RetryPolicy, batcher: Batcher) -> Self {
        Self { store, policy, batcher }
    }

    /// Write one batch, retrying transient failures.
    pub async fn write(&self, batch: &IngestionBatch, on_attempt: AttemptObserver<'_>) -> Result<Ack, SyncError> {
        let mut state = RetryState::new(self.policy);
        loop {
            let attempt = state.begin_attempt();
            on_attempt(attempt);
            match self.store.upsert_batch(batch).await {
                Ok(rows_written) => {
                    if attempt > 1 {
                        log::info!(
                            "sync: {} batch of {} rows acknowledged on attempt {}",
                            batch.table_id,
                            batch.len(),
                            attempt
                        );
                    }
                    return Ok(Ack {
                        rows_written,
                        batches: 1,
                        attempts: attempt,
                    });
                }
                Err(SyncError::Transient(reason)) => match state.next_delay() {
                    Some(delay) => {
                        log::warn!(
                            "sync: attempt {}/{} failed ({}), retrying in {:?}",
                            attempt,
                            self.policy.max_attempts,
                            reason,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(SyncError::Transient(format!(
                            "gave up after {} attempts: {}",
                            attempt, reason
                        )))
                    }
                },
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Drain a record stream into the store batch by batch. Stops at the first batch
    /// that cannot be written; rows of earlier batches stay written (upserts make the
    /// next attempt of the same file version converge).
    pub async fn write_stream(
        &self,
        table_id: &str,
        content_hash: &str,
        mut rx: mpsc::Receiver<NormalizedRecord>,
        on_attempt: AttemptObserver<'_>,
    ) -> Result<Ack, SyncError> {
        let mut total = Ack::default();
        while let Some(records) = self.batcher.next_batch(&mut rx).await {
            let batch = IngestionBatch::new(table_id, content_hash, records);
            let ack = self.write(&batch, on_attempt).await?;
            total.rows_written += ack.rows_written;
            total.batches += 1;
            total.attempts += ack.attempts;
        }
        Ok(total)
    }

    /// Feed an in-memory record set through the batcher.
    pub async fn write_records(
        &self,
        table_id: &str,
        content_hash: &str,
        records: Vec<NormalizedRecord>,
        on_attempt: AttemptObserver<'_>,
    ) -> Result<Ack, SyncError> {
        let (tx, rx) = mpsc::channel(records.len().clamp(1, 4096));
        let feeder = tokio::spawn(async move {
            for record in records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        let result = self.write_stream(table_id, content_hash, rx, on_attempt).await;
        feeder.abort();
        result
    }
}
