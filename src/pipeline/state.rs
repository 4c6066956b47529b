use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// Lifecycle of one file version inside the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Stable,
    Claimed,
    Parsing,
    Syncing { attempt: u32 },
    Synced,
    Failed,
    /// Content changed between hashing and parsing; the newer version gets its own event
    Superseded,
}

impl FileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Synced | FileState::Failed | FileState::Superseded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Stable => "stable",
            FileState::Claimed => "claimed",
            FileState::Parsing => "parsing",
            FileState::Syncing { .. } => "syncing",
            FileState::Synced => "synced",
            FileState::Failed => "failed",
            FileState::Superseded => "superseded",
        }
    }

    /// Forward-only transition table. A terminal entry may restart at
    /// `Discovered`/`Stable` when a new version of the path shows up.
    pub fn allows(&self, next: FileState) -> bool {
        use FileState::*;
        match (*self, next) {
            (Synced | Failed | Superseded, Discovered | Stable) => true,
            (Synced | Superseded, _) => false,
            (_, Failed) => true,
            (Discovered, Stable) => true,
            (Stable, Stable | Claimed | Synced) => true,
            (Claimed, Parsing) => true,
            (Claimed | Parsing | Syncing { .. }, Superseded) => true,
            (Parsing, Syncing { .. }) => true,
            // Attempt counter of the batch currently being written
            (Syncing { .. }, Syncing { .. }) => true,
            (Syncing { .. }, Synced) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
    pub hash: Option<String>,
    pub state: FileState,
    pub updated_at: Instant,
}

/// Per-state counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub discovered: usize,
    pub stable: usize,
    pub claimed: usize,
    pub parsing: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    pub superseded: usize,
}

/// Health probe payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub at: DateTime<Utc>,
    pub files: StateCounts,
    /// Files holding a worker slot
    pub in_flight: usize,
    pub active_claims: usize,
    pub stopping: bool,
}

/// Tracked files keyed by path. Only the coordinator mutates it.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: HashMap<PathBuf, WatchedFile>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A detector event arrived for `path`: (re)start its lifecycle. An entry still
    /// in flight keeps its state; returns whether the lifecycle restarted.
    pub fn discovered(&mut self, path: &Path, size: u64, modified: SystemTime) -> bool {
        if self.files.get(path).is_some_and(|f| !f.state.is_terminal()) {
            return false;
        }
        let now = Instant::now();
        self.files.insert(
            path.to_path_buf(),
            WatchedFile {
                path: path.to_path_buf(),
                modified,
                size,
                hash: None,
                state: FileState::Discovered,
                updated_at: now,
            },
        );
        true
    }

    pub fn set_hash(&mut self, path: &Path, hash: &str) {
        if let Some(file) = self.files.get_mut(path) {
            file.hash = Some(hash.to_string());
        }
    }

    /// Apply a transition. Returns false (and leaves the entry alone) when the
    /// table forbids it or the path is no longer tracked.
    pub fn transition(&mut self, path: &Path, next: FileState) -> bool {
        let Some(file) = self.files.get_mut(path) else {
            return false;
        };
        if file.state == next {
            return true;
        }
        if !file.state.allows(next) {
            log::warn!(
                "pipeline: ignoring transition {} -> {} for {}",
                file.state.name(),
                next.name(),
                path.display()
            );
            return false;
        }
        log::debug!("pipeline: {} {} -> {}", path.display(), file.state.name(), next.name());
        file.state = next;
        file.updated_at = Instant::now();
        true
    }

    pub fn get(&self, path: &Path) -> Option<&WatchedFile> {
        self.files.get(path)
    }

    pub fn state(&self, path: &Path) -> Option<FileState> {
        self.files.get(path).map(|f| f.state)
    }

    pub fn paths_where(&self, pred: impl Fn(FileState) -> bool) -> Vec<PathBuf> {
        self.files
            .values()
            .filter(|f| pred(f.state))
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for file in self.files.values() {
            match file.state {
                FileState::Discovered => counts.discovered += 1,
                FileState::Stable => counts.stable += 1,
                FileState::Claimed => counts.claimed += 1,
                FileState::Parsing => counts.parsing += 1,
                FileState::Syncing { .. } => counts.syncing += 1,
                FileState::Synced => counts.synced += 1,
                FileState::Failed => counts.failed += 1,
                FileState::Superseded => counts.superseded += 1,
            }
        }
        counts
    }

    /// Forget terminal entries untouched for `retain`. Returns how many were dropped.
    pub fn prune_terminal(&mut self, retain: Duration, now: Instant) -> usize {
        let before = self.files.len();
        self.files
            .retain(|_, f| !(f.state.is_terminal() && now.saturating_duration_since(f.updated_at) >= retain));
        before - self.files.len()
    }
}
