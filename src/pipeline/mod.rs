//! Pipeline coordinator: one state machine per file, run on a bounded worker pool.
//!
//! ```text
//! Discovered -> Stable -> Claimed -> Parsing -> Syncing{attempt} -> Synced
//!                  |                                                  ^
//!                  +---------------- AlreadyCommitted ----------------+
//! any non-terminal state -> Failed (claim released, `failed` event)
//! Claimed/Parsing/Syncing -> Superseded (file changed under us, claim released)
//! ```
//!
//! The ledger is committed only after the store acknowledged every batch. Each
//! file ends in exactly one notification; files claimed elsewhere are re-queued
//! with backoff rather than reported, and give their worker slot back while they
//! wait. One path is worked on by one task at a time: a newer event for a path in
//! flight runs after the current one.

mod state;

pub use state::{FileRegistry, FileState, HealthSnapshot, StateCounts, WatchedFile};

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::{Config, ParserConfig};
use crate::error::{ParseError, Result, TabsyncError};
use crate::events::{EventBus, PipelineEvent};
use crate::ingest::{check_size, compute_file_hash, hash_bytes, parse_bytes, read_bounded, CompiledSchema, ParsedFile};
use crate::ledger::{is_contention, ClaimOutcome, ClaimToken, Ledger};
use crate::sync::{Store, SyncWriter};
use crate::watch::FileReadyEvent;

/// How one file's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Synced { rows: u64, already_committed: bool },
    Failed { kind: &'static str },
    /// The file changed after it was claimed; the detector has a newer version queued.
    Superseded,
    /// Given up because the pipeline is stopping
    Abandoned,
}

/// Totals for one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub synced: usize,
    pub already_committed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub released_on_shutdown: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Synced { already_committed: true, .. } => self.already_committed += 1,
            FileOutcome::Synced { .. } => self.synced += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::Superseded | FileOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

enum ParseStage {
    Parsed(ParsedFile),
    Changed { current: String },
}

/// Claims held by running per-file tasks, released in bulk on shutdown.
#[derive(Debug, Default)]
struct ActiveClaims {
    tokens: Mutex<HashSet<ClaimToken>>,
}

impl ActiveClaims {
    fn insert(&self, token: &ClaimToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token.clone());
        }
    }

    fn remove(&self, token: &ClaimToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(token);
        }
    }

    fn drain(&self) -> Vec<ClaimToken> {
        self.tokens.lock().map(|mut t| t.drain().collect()).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }
}

struct Inner {
    schema: CompiledSchema,
    parser: ParserConfig,
    ledger: Ledger,
    writer: SyncWriter,
    bus: EventBus,
    registry: Mutex<FileRegistry>,
    active: ActiveClaims,
    /// Paths with a running task, and the newest event that arrived meanwhile
    running: Mutex<HashMap<PathBuf, Option<FileReadyEvent>>>,
    permits: Arc<Semaphore>,
    stopping: AtomicBool,
    in_flight: AtomicUsize,
    workers: usize,
    file_timeout: Duration,
    shutdown_grace: Duration,
    requeue_backoff: Duration,
    requeue_backoff_cap: Duration,
    retain_terminal: Duration,
    health_interval: Duration,
    health_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: &Config, ledger: Ledger, store: Arc<dyn Store>, bus: EventBus) -> Result<Self> {
        let schema = CompiledSchema::compile(&config.schema.table, &config.schema.columns)?;
        let coordinator = &config.coordinator;
        Ok(Self {
            inner: Arc::new(Inner {
                schema,
                parser: config.parser.clone(),
                ledger,
                writer: SyncWriter::new(store, &config.sync),
                bus,
                registry: Mutex::new(FileRegistry::new()),
                active: ActiveClaims::default(),
                running: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(coordinator.workers.max(1))),
                stopping: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                workers: coordinator.workers.max(1),
                file_timeout: Duration::from_secs(coordinator.file_timeout_secs),
                shutdown_grace: Duration::from_millis(coordinator.shutdown_grace_ms),
                requeue_backoff: Duration::from_millis(config.ledger.requeue_backoff_ms.max(1)),
                requeue_backoff_cap: Duration::from_millis(config.ledger.requeue_backoff_cap_ms.max(1)),
                retain_terminal: Duration::from_secs(coordinator.retain_terminal_secs),
                health_interval: Duration::from_secs(coordinator.health_interval_secs.max(1)),
                health_file: coordinator.health_file.clone(),
            }),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn state_of(&self, path: &Path) -> Option<FileState> {
        self.inner.registry.lock().ok().and_then(|r| r.state(path))
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn transition(&self, path: &Path, next: FileState) {
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.transition(path, next);
        }
    }

    fn discovered(&self, event: &FileReadyEvent) {
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.discovered(&event.path, event.size, event.modified);
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if self.inner.bus.publish(event) == 0 {
            log::debug!("pipeline: no subscribers for notification");
        }
    }

    /// Drive one file from `Stable` to a terminal state.
    pub async fn process(&self, event: FileReadyEvent) -> FileOutcome {
        let path = event.path.clone();
        self.discovered(&event);
        self.transition(&path, FileState::Stable);
        let Some(slot) = self.worker_slot().await else {
            return FileOutcome::Abandoned;
        };
        let started = Instant::now();

        let hash_path = path.clone();
        let parser = self.inner.parser.clone();
        let hashed = tokio::task::spawn_blocking(move || -> Result<String> {
            // Reject oversized files before reading them end to end
            check_size(&hash_path, &parser)?;
            compute_file_hash(&hash_path)
        })
        .await;
        let hash = match hashed {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => return self.fail(&path, "", None, e).await,
            Err(e) => {
                let err = TabsyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                return self.fail(&path, "", None, err).await;
            }
        };
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.set_hash(&path, &hash);
        }

        let (claimed, _slot) = match self.claim(&path, &hash, slot).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return FileOutcome::Abandoned,
            Err(e) => return self.fail(&path, &hash, None, e).await,
        };
        let token = match claimed {
            Claimed::Token(token) => token,
            Claimed::AlreadyCommitted { row_count } => {
                log::info!(
                    "✓ {} already committed ({} rows, hash {})",
                    path.display(),
                    row_count,
                    short(&hash)
                );
                self.transition(&path, FileState::Synced);
                self.publish(PipelineEvent::ingested(&path, &hash, row_count, true));
                return FileOutcome::Synced {
                    rows: row_count,
                    already_committed: true,
                };
            }
        };

        self.inner.active.insert(&token);
        self.transition(&path, FileState::Claimed);

        let result = match tokio::time::timeout(self.inner.file_timeout, self.parse_and_sync(&path, &token)).await {
            Ok(result) => result,
            Err(_) => Err(TabsyncError::Timeout(self.inner.file_timeout)),
        };

        match result {
            Ok(Some(rows)) => match self.inner.ledger.commit(&token, rows).await {
                Ok(()) => {
                    self.inner.active.remove(&token);
                    self.transition(&path, FileState::Synced);
                    log::info!(
                        "✓ {} synced {} rows into '{}' in {:?}",
                        path.display(),
                        rows,
                        self.inner.schema.table,
                        started.elapsed()
                    );
                    self.publish(PipelineEvent::ingested(&path, &hash, rows, false));
                    FileOutcome::Synced {
                        rows,
                        already_committed: false,
                    }
                }
                Err(e) => self.fail(&path, &hash, Some(&token), e).await,
            },
            Ok(None) => {
                self.release(&token, "content changed after claim").await;
                self.transition(&path, FileState::Superseded);
                log::warn!("{} changed while being ingested; waiting for the new version", path.display());
                FileOutcome::Superseded
            }
            Err(e) => self.fail(&path, &hash, Some(&token), e).await,
        }
    }

    /// Take a worker slot. `None` once the pipeline is stopping.
    async fn worker_slot(&self) -> Option<WorkerSlot<'_>> {
        let permit = self.inner.permits.clone().acquire_owned().await.ok()?;
        if self.is_stopping() {
            return None;
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(WorkerSlot {
            _permit: permit,
            in_flight: &self.inner.in_flight,
        })
    }

    /// Claim `hash`, re-queueing with backoff while another attempt holds it or the
    /// ledger is locked. The worker slot is given back during each backoff.
    /// `Ok(None)` means the pipeline began stopping while waiting.
    async fn claim<'a>(
        &'a self,
        path: &Path,
        hash: &str,
        mut slot: WorkerSlot<'a>,
    ) -> Result<Option<(Claimed, WorkerSlot<'a>)>> {
        let mut backoff = self.inner.requeue_backoff;
        loop {
            if self.is_stopping() {
                return Ok(None);
            }
            let reason = match self.inner.ledger.claim(hash, path).await {
                Ok(ClaimOutcome::Proceed(token)) => return Ok(Some((Claimed::Token(token), slot))),
                Ok(ClaimOutcome::AlreadyCommitted { row_count }) => {
                    return Ok(Some((Claimed::AlreadyCommitted { row_count }, slot)))
                }
                Ok(ClaimOutcome::ClaimedByOther) => "claimed elsewhere",
                Err(e) if is_contention(&e) => {
                    log::warn!("pipeline: ledger busy while claiming {}: {}", short(hash), e);
                    "ledger busy"
                }
                Err(e) => return Err(e),
            };
            log::debug!("pipeline: {} {}, re-queued for {:?}", short(hash), reason, backoff);
            drop(slot);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.inner.requeue_backoff_cap);
            slot = match self.worker_slot().await {
                Some(slot) => slot,
                None => return Ok(None),
            };
        }
    }

    /// Parsing + Syncing. Returns the row count, or `None` if the file no longer
    /// matches the claimed hash.
    async fn parse_and_sync(&self, path: &Path, token: &ClaimToken) -> Result<Option<u64>> {
        self.transition(path, FileState::Parsing);

        let parse_path = path.to_path_buf();
        let expected = token.hash().to_string();
        let schema = self.inner.schema.clone();
        let parser = self.inner.parser.clone();
        let stage = tokio::task::spawn_blocking(move || read_and_parse(&parse_path, &expected, &schema, &parser))
            .await
            .map_err(|e| TabsyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;

        let parsed = match stage {
            ParseStage::Parsed(parsed) => parsed,
            ParseStage::Changed { current } => {
                log::debug!("pipeline: {} now hashes to {}", path.display(), short(&current));
                return Ok(None);
            }
        };
        for skipped in &parsed.skipped {
            log::warn!("{}: skipped {}", path.display(), skipped);
        }

        let rows = parsed.row_count() as u64;
        self.transition(path, FileState::Syncing { attempt: 1 });
        let this = self.clone();
        let observed = path.to_path_buf();
        let on_attempt = move |attempt: u32| this.transition(&observed, FileState::Syncing { attempt });

        let ack = self
            .inner
            .writer
            .write_records(&self.inner.schema.table, token.hash(), parsed.records, &on_attempt)
            .await?;
        log::debug!(
            "pipeline: {} acknowledged {} rows in {} batch(es), {} store call(s)",
            path.display(),
            ack.rows_written,
            ack.batches,
            ack.attempts
        );
        Ok(Some(rows))
    }

    async fn release(&self, token: &ClaimToken, reason: &str) {
        self.inner.active.remove(token);
        match self.inner.ledger.release(token, Some(reason)).await {
            Ok(true) => {}
            Ok(false) => log::warn!("pipeline: claim on {} was no longer held", short(token.hash())),
            Err(e) => log::error!("pipeline: could not release {}: {}", short(token.hash()), e),
        }
    }

    async fn fail(&self, path: &Path, hash: &str, token: Option<&ClaimToken>, err: TabsyncError) -> FileOutcome {
        if let Some(token) = token {
            self.release(token, &format!("{}: {}", err.kind(), err)).await;
        }
        self.transition(path, FileState::Failed);
        log::error!("✗ {} failed ({}): {}", path.display(), err.kind(), err);
        self.publish(PipelineEvent::failed(path, hash, &err));
        FileOutcome::Failed { kind: err.kind() }
    }

    pub fn health(&self) -> HealthSnapshot {
        let files = self
            .inner
            .registry
            .lock()
            .map(|r| r.counts())
            .unwrap_or_default();
        HealthSnapshot {
            at: Utc::now(),
            files,
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            active_claims: self.inner.active.len(),
            stopping: self.is_stopping(),
        }
    }

    /// Log the snapshot, write it to the health file if configured, prune old entries.
    pub async fn report_health(&self) {
        let pruned = self
            .inner
            .registry
            .lock()
            .map(|mut r| r.prune_terminal(self.inner.retain_terminal, Instant::now()))
            .unwrap_or(0);
        let snapshot = self.health();
        let f = &snapshot.files;
        log::info!(
            "health: stable={} claimed={} parsing={} syncing={} synced={} failed={} superseded={} in_flight={} (pruned {})",
            f.stable + f.discovered,
            f.claimed,
            f.parsing,
            f.syncing,
            f.synced,
            f.failed,
            f.superseded,
            snapshot.in_flight,
            pruned
        );
        if let Some(path) = &self.inner.health_file {
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => {
                    if let Err(e) = tokio::fs::write(path, json).await {
                        log::warn!("health: cannot write {}: {}", path.display(), e);
                    }
                }
                Err(e) => log::warn!("health: cannot serialize snapshot: {}", e),
            }
        }
    }

    /// Consume detector events until the stream ends (then drain all work) or
    /// `shutdown` flips to true (then wait out the grace period, abort what is
    /// left and release its claims).
    pub async fn run<S>(&self, events: S, mut shutdown: watch::Receiver<bool>) -> RunSummary
    where
        S: Stream<Item = FileReadyEvent> + Unpin,
    {
        let mut events = events;
        let mut tasks: JoinSet<Vec<FileOutcome>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut health = tokio::time::interval(self.inner.health_interval);
        health.tick().await;

        log::info!("pipeline: running with {} worker(s)", self.inner.workers);
        let already_stopped = *shutdown.borrow();
        let stopped = already_stopped || loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(event) => self.spawn_file(&mut tasks, event),
                    None => break false,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::record_join(&mut summary, joined);
                }
                _ = health.tick() => self.report_health().await,
            }
        };

        if stopped {
            self.inner.stopping.store(true, Ordering::SeqCst);
            log::info!(
                "pipeline: stopping, waiting up to {:?} for {} task(s)",
                self.inner.shutdown_grace,
                tasks.len()
            );
            let grace = tokio::time::sleep(self.inner.shutdown_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        Some(joined) => Self::record_join(&mut summary, joined),
                        None => break,
                    },
                    _ = &mut grace => {
                        log::warn!("pipeline: grace period over, aborting {} task(s)", tasks.len());
                        tasks.abort_all();
                        while let Some(joined) = tasks.join_next().await {
                            Self::record_join(&mut summary, joined);
                        }
                        break;
                    }
                }
            }
            summary.released_on_shutdown = self.release_active_claims().await;
        } else {
            while let Some(joined) = tasks.join_next().await {
                Self::record_join(&mut summary, joined);
            }
        }

        self.report_health().await;
        log::info!(
            "pipeline: stopped (synced {}, already committed {}, failed {}, abandoned {}, released {})",
            summary.synced,
            summary.already_committed,
            summary.failed,
            summary.abandoned,
            summary.released_on_shutdown
        );
        summary
    }

    /// Start a task for `event`, or hand it to the task already working on its path.
    fn spawn_file(&self, tasks: &mut JoinSet<Vec<FileOutcome>>, event: FileReadyEvent) {
        if let Ok(mut running) = self.inner.running.lock() {
            if let Some(next) = running.get_mut(&event.path) {
                log::debug!("pipeline: {} already in flight, newer event queued", event.path.display());
                *next = Some(event);
                return;
            }
            running.insert(event.path.clone(), None);
        }
        self.discovered(&event);
        let this = self.clone();
        tasks.spawn(async move {
            let path = event.path.clone();
            let mut outcomes = vec![this.process(event).await];
            while let Some(next) = this.next_for(&path) {
                outcomes.push(this.process(next).await);
            }
            outcomes
        });
    }

    /// The event queued for `path` while it was in flight; clears the path when none is.
    fn next_for(&self, path: &Path) -> Option<FileReadyEvent> {
        let mut running = self.inner.running.lock().ok()?;
        let next = running.get_mut(path).and_then(|next| next.take());
        if next.is_none() {
            running.remove(path);
        }
        next
    }

    fn record_join(summary: &mut RunSummary, joined: std::result::Result<Vec<FileOutcome>, tokio::task::JoinError>) {
        match joined {
            Ok(outcomes) => outcomes.iter().for_each(|outcome| summary.record(outcome)),
            Err(e) if e.is_cancelled() => summary.abandoned += 1,
            Err(e) => {
                log::error!("pipeline: file task panicked: {}", e);
                summary.failed += 1;
            }
        }
    }

    /// Release every claim still held by an aborted task.
    async fn release_active_claims(&self) -> usize {
        let tokens = self.inner.active.drain();
        let mut released = 0;
        for token in &tokens {
            match self.inner.ledger.release(token, Some("Shutdown: pipeline stopped")).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => log::error!("pipeline: could not release {} on shutdown: {}", short(token.hash()), e),
            }
        }
        if let Ok(mut registry) = self.inner.registry.lock() {
            let interrupted = registry
                .paths_where(|s| matches!(s, FileState::Claimed | FileState::Parsing | FileState::Syncing { .. }));
            for path in interrupted {
                registry.transition(&path, FileState::Failed);
            }
        }
        if released > 0 {
            log::warn!("pipeline: released {} in-flight claim(s) on shutdown", released);
        }
        released
    }
}

enum Claimed {
    Token(ClaimToken),
    AlreadyCommitted { row_count: u64 },
}

/// A worker permit, counted in `in_flight` while held
struct WorkerSlot<'a> {
    _permit: OwnedSemaphorePermit,
    in_flight: &'a AtomicUsize,
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn read_and_parse(
    path: &Path,
    expected_hash: &str,
    schema: &CompiledSchema,
    config: &ParserConfig,
) -> Result<ParseStage> {
    let content = read_bounded(path, config)?;
    let current = hash_bytes(&content);
    if current != expected_hash {
        return Ok(ParseStage::Changed { current });
    }
    Ok(ParseStage::Parsed(parse_bytes(&content, path, schema, config)?))
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
