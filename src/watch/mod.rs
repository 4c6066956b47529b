//! File change detector: a debounced stream of "file ready" events for a directory.
//!
//! `watch` spawns a detector thread around the notify crate. Raw create/modify/rename
//! notifications go through a [`Debouncer`]; a file is emitted once its size and
//! mtime have held still for the quiet period. If the watch fails it is
//! re-established with backoff and the directory is re-listed, so files written
//! while it was down still come through. Events missed before `watch` was called
//! are recovered with [`rescan`].

mod debounce;
mod watcher;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::DetectorConfig;
use crate::error::{DetectionError, Result, TabsyncError};
use crate::ingest::{compute_file_hash, discover_files, FilePattern};
use crate::ledger::Ledger;

pub use debounce::Debouncer;

/// A file whose content has settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadyEvent {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub type FileReadyStream = ReceiverStream<FileReadyEvent>;

/// Start watching `dir`. The detector thread stops once the returned stream is dropped.
pub fn watch(dir: &Path, pattern: &FilePattern, config: &DetectorConfig, recursive: bool) -> Result<FileReadyStream> {
    std::fs::read_dir(dir).map_err(|e| DetectionError::Access {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let settings = watcher::WatcherSettings {
        root: dir.to_path_buf(),
        pattern: pattern.clone(),
        recursive,
        debounce: Duration::from_millis(config.debounce_ms),
        poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        retry_backoff: Duration::from_millis(config.retry_backoff_ms.max(1)),
    };

    let (tx, rx) = mpsc::channel(256);
    std::thread::Builder::new()
        .name("tabsync-watch".to_string())
        .spawn(move || watcher::run_watcher_thread(settings, tx))?;
    Ok(ReceiverStream::new(rx))
}

/// List the directory and return ready events for every matching file whose
/// content hash is not yet committed in the ledger.
pub async fn rescan(dir: &Path, pattern: &FilePattern, recursive: bool, ledger: &Ledger) -> Result<Vec<FileReadyEvent>> {
    let root = dir.to_path_buf();
    let pattern = pattern.clone();
    let hashed = tokio::task::spawn_blocking(move || -> Result<Vec<(FileReadyEvent, String)>> {
        let mut out = Vec::new();
        for file in discover_files(&root, &pattern, recursive)? {
            match compute_file_hash(&file.absolute_path) {
                Ok(hash) => out.push((
                    FileReadyEvent {
                        path: file.absolute_path,
                        size: file.file_size,
                        modified: file.modified,
                    },
                    hash,
                )),
                // Removed between listing and hashing
                Err(e) => log::warn!("rescan: skipping {}: {}", file.relative_path, e),
            }
        }
        Ok(out)
    })
    .await
    .map_err(|e| TabsyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("rescan task join: {}", e))))??;

    let mut pending = Vec::new();
    let mut skipped = 0;
    for (event, hash) in hashed {
        if ledger.is_committed(&hash).await? {
            skipped += 1;
        } else {
            pending.push(event);
        }
    }
    log::info!(
        "rescan: {} file(s) to ingest, {} already committed in {}",
        pending.len(),
        skipped,
        dir.display()
    );
    Ok(pending)
}
