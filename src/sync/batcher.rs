use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::ingest::NormalizedRecord;

/// Cuts a record stream into batches of at most `max_size`, flushing early once
/// `max_wait` has passed since the first record of the batch arrived.
#[derive(Debug, Clone, Copy)]
pub struct Batcher {
    max_size: usize,
    max_wait: Duration,
}

impl Batcher {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_wait,
        }
    }

    /// Next batch, or `None` once the sender side is closed and drained.
    pub async fn next_batch(&self, rx: &mut mpsc::Receiver<NormalizedRecord>) -> Option<Vec<NormalizedRecord>> {
        let first = rx.recv().await?;
        let deadline = Instant::now() + self.max_wait;
        let mut batch = Vec::with_capacity(self.max_size.min(1024));
        batch.push(first);

        while batch.len() < self.max_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(record)) => batch.push(record),
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }
}
