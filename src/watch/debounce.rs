use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::FileReadyEvent;
use crate::ingest::FileStamp;

/// `emitted` is swept of files that changed or disappeared once it grows past this.
const EMITTED_SWEEP_MIN: usize = 1024;

#[derive(Debug, Clone)]
struct Pending {
    last_event: Instant,
    stamp: Option<FileStamp>,
    stable_since: Instant,
}

/// In-flight debounce timers, one per path.
///
/// Owned by the watcher thread for the lifetime of one `watch` call and dropped
/// with it. Time and file metadata are passed in, so tests can drive it without
/// sleeping or touching a real filesystem.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: HashMap<PathBuf, Pending>,
    /// Last stamp emitted per path; metadata-only noise after an emission is dropped.
    emitted: HashMap<PathBuf, FileStamp>,
    sweep_at: usize,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
            emitted: HashMap::new(),
            sweep_at: EMITTED_SWEEP_MIN,
        }
    }

    /// A raw change notification for `path`. Restarts the quiet period.
    pub fn observe(&mut self, path: &Path, now: Instant) {
        self.pending
            .entry(path.to_path_buf())
            .and_modify(|p| p.last_event = now)
            .or_insert(Pending {
                last_event: now,
                stamp: None,
                stable_since: now,
            });
    }

    /// Deletion or rename-away: forget the path without emitting.
    pub fn cancel(&mut self, path: &Path) -> bool {
        self.emitted.remove(path);
        self.pending.remove(path).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    /// Re-stat every pending path and return those whose size and mtime have held
    /// still, with no raw events, for the whole quiet period.
    pub fn tick<F>(&mut self, now: Instant, stat: F) -> Vec<FileReadyEvent>
    where
        F: Fn(&Path) -> Option<FileStamp>,
    {
        let mut ready = Vec::new();
        let mut vanished = Vec::new();

        for (path, pending) in self.pending.iter_mut() {
            let Some(current) = stat(path) else {
                vanished.push(path.clone());
                continue;
            };
            if pending.stamp != Some(current) {
                pending.stamp = Some(current);
                pending.stable_since = now;
                continue;
            }
            let quiet_from = pending.last_event.max(pending.stable_since);
            if now.saturating_duration_since(quiet_from) >= self.quiet {
                ready.push((path.clone(), current));
            }
        }

        for path in vanished {
            log::debug!("watch: {} vanished before it settled", path.display());
            self.pending.remove(&path);
        }

        let mut events = Vec::with_capacity(ready.len());
        for (path, stamp) in ready {
            self.pending.remove(&path);
            if self.emitted.get(&path) == Some(&stamp) {
                log::debug!("watch: {} unchanged since last emission", path.display());
                continue;
            }
            self.emitted.insert(path.clone(), stamp);
            events.push(FileReadyEvent {
                path,
                size: stamp.size,
                modified: stamp.modified,
            });
        }
        if self.emitted.len() > self.sweep_at {
            self.sweep_emitted(&stat);
        }

        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    /// Forget emitted stamps that no longer match the file on disk. A changed file
    /// is emitted again anyway, so only stamps still on disk need remembering.
    fn sweep_emitted<F>(&mut self, stat: &F)
    where
        F: Fn(&Path) -> Option<FileStamp>,
    {
        let before = self.emitted.len();
        self.emitted.retain(|path, stamp| stat(path).as_ref() == Some(stamp));
        self.sweep_at = (self.emitted.len() * 2).max(EMITTED_SWEEP_MIN);
        log::debug!(
            "watch: forgot {} stale emission stamp(s), {} kept",
            before - self.emitted.len(),
            self.emitted.len()
        );
    }

    /// Drop all timers (graceful stop).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.emitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::SystemTime;

    struct FakeFs {
        files: RefCell<HashMap<PathBuf, FileStamp>>,
    }

    impl FakeFs {
        fn new() -> Self {
            Self {
                files: RefCell::new(HashMap::new()),
            }
        }

        fn write(&self, path: &Path, size: u64, mtime_secs: u64) {
            self.files.borrow_mut().insert(
                path.to_path_buf(),
                FileStamp {
                    size,
                    modified: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs),
                },
            );
        }

        fn remove(&self, path: &Path) {
            self.files.borrow_mut().remove(path);
        }

        fn stat(&self) -> impl Fn(&Path) -> Option<FileStamp> + '_ {
            move |p| self.files.borrow().get(p).copied()
        }
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn test_chunked_write_emits_once() {
        let fs = FakeFs::new();
        let path = Path::new("/drop/products.csv");
        let mut d = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();

        // Five chunks, 30ms apart, each growing the file
        let mut emitted = Vec::new();
        for i in 0..5u64 {
            fs.write(path, 100 * (i + 1), 1000 + i);
            d.observe(path, at(start, i * 30));
            emitted.extend(d.tick(at(start, i * 30 + 10), fs.stat()));
        }
        assert!(emitted.is_empty());

        // Ticks keep coming after the last chunk
        for ms in (200..600).step_by(20) {
            emitted.extend(d.tick(at(start, ms), fs.stat()));
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].size, 500);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_size_change_without_event_restarts_quiet_period() {
        let fs = FakeFs::new();
        let path = Path::new("/drop/slow.csv");
        let mut d = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();

        fs.write(path, 10, 1);
        d.observe(path, start);
        assert!(d.tick(at(start, 50), fs.stat()).is_empty());
        fs.write(path, 20, 2);
        assert!(d.tick(at(start, 120), fs.stat()).is_empty());
        assert!(d.tick(at(start, 200), fs.stat()).is_empty());
        assert_eq!(d.tick(at(start, 230), fs.stat()).len(), 1);
    }

    #[test]
    fn test_delete_cancels_pending() {
        let fs = FakeFs::new();
        let path = Path::new("/drop/gone.csv");
        let mut d = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();

        fs.write(path, 10, 1);
        d.observe(path, start);
        d.tick(at(start, 10), fs.stat());
        assert!(d.cancel(path));
        fs.remove(path);
        assert!(d.tick(at(start, 500), fs.stat()).is_empty());
        assert!(!d.is_pending(path));
    }

    #[test]
    fn test_vanished_file_dropped_silently() {
        let fs = FakeFs::new();
        let path = Path::new("/drop/tmp.csv");
        let mut d = Debouncer::new(Duration::from_millis(10));
        let start = Instant::now();

        d.observe(path, start);
        assert!(d.tick(at(start, 50), fs.stat()).is_empty());
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_metadata_noise_after_emit_is_suppressed() {
        let fs = FakeFs::new();
        let path = Path::new("/drop/a.csv");
        let mut d = Debouncer::new(Duration::from_millis(10));
        let start = Instant::now();

        fs.write(path, 10, 1);
        d.observe(path, start);
        d.tick(at(start, 1), fs.stat());
        assert_eq!(d.tick(at(start, 20), fs.stat()).len(), 1);

        // chmod-style event, same size and mtime
        d.observe(path, at(start, 30));
        d.tick(at(start, 31), fs.stat());
        assert!(d.tick(at(start, 60), fs.stat()).is_empty());

        // Re-dropped (new mtime) emits again
        fs.write(path, 10, 2);
        d.observe(path, at(start, 70));
        d.tick(at(start, 71), fs.stat());
        assert_eq!(d.tick(at(start, 100), fs.stat()).len(), 1);
    }

    #[test]
    fn test_emitted_stamps_swept_when_files_go_away() {
        let fs = FakeFs::new();
        let mut d = Debouncer::new(Duration::from_millis(10));
        let start = Instant::now();

        let paths: Vec<PathBuf> = (0..EMITTED_SWEEP_MIN)
            .map(|i| PathBuf::from(format!("/drop/f{}.csv", i)))
            .collect();
        for path in &paths {
            fs.write(path, 10, 1);
            d.observe(path, start);
        }
        d.tick(at(start, 1), fs.stat());
        assert_eq!(d.tick(at(start, 20), fs.stat()).len(), EMITTED_SWEEP_MIN);
        assert_eq!(d.emitted_count(), EMITTED_SWEEP_MIN);

        // Ingested files get moved away by the operator
        for path in &paths {
            fs.remove(path);
        }

        let last = PathBuf::from("/drop/last.csv");
        fs.write(&last, 1, 1);
        d.observe(&last, at(start, 30));
        d.tick(at(start, 31), fs.stat());
        assert_eq!(d.tick(at(start, 50), fs.stat()).len(), 1);
        assert_eq!(d.emitted_count(), 1);

        // The kept stamp still suppresses noise
        d.observe(&last, at(start, 60));
        d.tick(at(start, 61), fs.stat());
        assert!(d.tick(at(start, 80), fs.stat()).is_empty());
    }
}
