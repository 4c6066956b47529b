//! Watcher thread: notify events feed the debouncer, settled files go out on a tokio channel.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc as tokio_mpsc;

use super::debounce::Debouncer;
use super::FileReadyEvent;
use crate::error::DetectionError;
use crate::ingest::walker::is_hidden;
use crate::ingest::{discover_files, FilePattern, FileStamp};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Observe(PathBuf),
    Cancel(PathBuf),
}

enum Message {
    Event(notify::Event),
    Error(String),
}

#[derive(Debug, Clone)]
pub(crate) struct WatcherSettings {
    pub root: PathBuf,
    pub pattern: FilePattern,
    pub recursive: bool,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
}

/// Translate one raw notification into debouncer actions. Paths that do not match
/// the pattern, and dotfiles, are dropped here.
pub(crate) fn actions_for(event: &notify::Event, pattern: &FilePattern) -> Vec<Action> {
    let relevant = |p: &PathBuf| pattern.matches(p) && !is_hidden(p);
    let observe = |p: &PathBuf| relevant(p).then(|| Action::Observe(p.clone()));
    let cancel = |p: &PathBuf| relevant(p).then(|| Action::Cancel(p.clone()));

    match &event.kind {
        EventKind::Create(_) => event.paths.iter().filter_map(observe).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event.paths.iter().filter_map(cancel).collect(),
            RenameMode::To => event.paths.iter().filter_map(observe).collect(),
            RenameMode::Both => {
                let mut out = Vec::new();
                if let Some(from) = event.paths.first() {
                    out.extend(cancel(from));
                }
                if let Some(to) = event.paths.get(1) {
                    out.extend(observe(to));
                }
                out
            }
            // Platform did not say which side: decide by whether the path still exists
            _ => event
                .paths
                .iter()
                .filter_map(|p| if p.exists() { observe(p) } else { cancel(p) })
                .collect(),
        },
        EventKind::Modify(_) => event.paths.iter().filter_map(observe).collect(),
        EventKind::Remove(_) => event.paths.iter().filter_map(cancel).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn start_watcher(settings: &WatcherSettings, msg_tx: mpsc::Sender<Message>) -> Result<RecommendedWatcher, DetectionError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let msg = match res {
            Ok(ev) => Message::Event(ev),
            Err(e) => Message::Error(e.to_string()),
        };
        let _ = msg_tx.send(msg);
    })
    .map_err(|e| DetectionError::Watch(e.to_string()))?;

    let mode = if settings.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(&settings.root, mode).map_err(|e| DetectionError::Access {
        path: settings.root.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(watcher)
}

/// The watched directory itself was deleted or moved away. Its watch is dead even if
/// a directory with the same name shows up again.
fn root_gone(event: &notify::Event, root: &Path) -> bool {
    matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
        && event.paths.iter().any(|p| p == root)
        && !root.is_dir()
}

/// Put every matching file under the root back into the debouncer. Used after the
/// watch was re-established, to pick up files written while nothing was watching.
/// Files already emitted with the same stamp stay suppressed.
pub(crate) fn relist(settings: &WatcherSettings, debouncer: &mut Debouncer, now: Instant) -> Result<usize, DetectionError> {
    if !settings.root.is_dir() {
        return Err(DetectionError::Access {
            path: settings.root.display().to_string(),
            reason: "watch directory is missing".to_string(),
        });
    }
    let files = discover_files(&settings.root, &settings.pattern, settings.recursive).map_err(|e| {
        DetectionError::Access {
            path: settings.root.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    for file in &files {
        debouncer.observe(&file.absolute_path, now);
    }
    Ok(files.len())
}

/// Pump one watcher until it fails (`Err`) or the receiver goes away (`Ok`).
fn pump(
    settings: &WatcherSettings,
    msg_rx: &mpsc::Receiver<Message>,
    debouncer: &mut Debouncer,
    tx: &tokio_mpsc::Sender<FileReadyEvent>,
) -> Result<(), DetectionError> {
    loop {
        if tx.is_closed() {
            return Ok(());
        }
        match msg_rx.recv_timeout(settings.poll_interval) {
            Ok(Message::Event(ev)) => {
                if root_gone(&ev, &settings.root) {
                    return Err(DetectionError::Access {
                        path: settings.root.display().to_string(),
                        reason: "watch directory removed".to_string(),
                    });
                }
                let now = Instant::now();
                for action in actions_for(&ev, &settings.pattern) {
                    match action {
                        Action::Observe(p) => debouncer.observe(&p, now),
                        Action::Cancel(p) => {
                            if debouncer.cancel(&p) {
                                log::debug!("watch: {} removed before it settled", p.display());
                            }
                        }
                    }
                }
            }
            Ok(Message::Error(reason)) => return Err(DetectionError::Watch(reason)),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(DetectionError::Watch("event source closed".to_string()))
            }
        }

        for event in debouncer.tick(Instant::now(), FileStamp::of) {
            log::debug!("watch: {} stable ({} bytes)", event.path.display(), event.size);
            if tx.blocking_send(event).is_err() {
                return Ok(());
            }
        }

        if !settings.root.is_dir() {
            return Err(DetectionError::Access {
                path: settings.root.display().to_string(),
                reason: "watch directory disappeared".to_string(),
            });
        }
    }
}

/// Body of the detector thread. Watcher failures are logged and the watch is
/// re-established with exponential backoff; pending timers survive the restart and
/// the directory is re-listed once the new watch is in place.
pub(crate) fn run_watcher_thread(settings: WatcherSettings, tx: tokio_mpsc::Sender<FileReadyEvent>) {
    let mut debouncer = Debouncer::new(settings.debounce);
    let mut backoff = settings.retry_backoff;
    let mut restarted = false;

    while !tx.is_closed() {
        let (msg_tx, msg_rx) = mpsc::channel();
        let result = start_watcher(&settings, msg_tx).and_then(|_watcher| {
            log::info!("watch: observing {} for '{}'", settings.root.display(), settings.pattern.as_str());
            if restarted {
                let found = relist(&settings, &mut debouncer, Instant::now())?;
                log::info!("watch: re-listed {} file(s) after re-establishing the watch", found);
            }
            backoff = settings.retry_backoff;
            pump(&settings, &msg_rx, &mut debouncer, &tx)
        });
        restarted = true;

        match result {
            Ok(()) => break,
            Err(e) => {
                log::error!("watch: {} (retrying in {:?})", e, backoff);
                if sleep_unless_closed(backoff, &tx) {
                    break;
                }
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
        }
    }

    debouncer.clear();
    log::debug!("watch: detector for {} stopped", settings.root.display());
}

/// Sleep in short steps; returns `true` if the consumer went away meanwhile.
fn sleep_unless_closed(total: Duration, tx: &tokio_mpsc::Sender<FileReadyEvent>) -> bool {
    let step = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if tx.is_closed() {
            return true;
        }
        std::thread::sleep(step.min(deadline.saturating_duration_since(Instant::now())));
    }
    tx.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn ev(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut e = notify::Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn test_event_mapping() {
        let pattern = FilePattern::new("*.csv").unwrap();

        let create = ev(EventKind::Create(CreateKind::File), &["/d/a.csv", "/d/notes.txt"]);
        assert_eq!(actions_for(&create, &pattern), vec![Action::Observe("/d/a.csv".into())]);

        let write = ev(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/d/a.csv"]);
        assert_eq!(actions_for(&write, &pattern), vec![Action::Observe("/d/a.csv".into())]);

        let remove = ev(EventKind::Remove(RemoveKind::File), &["/d/a.csv"]);
        assert_eq!(actions_for(&remove, &pattern), vec![Action::Cancel("/d/a.csv".into())]);

        let rename = ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/a.csv", "/d/b.csv"],
        );
        assert_eq!(
            actions_for(&rename, &pattern),
            vec![Action::Cancel("/d/a.csv".into()), Action::Observe("/d/b.csv".into())]
        );

        // Upload tools often write a dotfile and rename it into place
        let finish_upload = ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/.a.csv.part", "/d/a.csv"],
        );
        assert_eq!(actions_for(&finish_upload, &pattern), vec![Action::Observe("/d/a.csv".into())]);

        let hidden = ev(EventKind::Create(CreateKind::File), &["/d/.a.csv"]);
        assert!(actions_for(&hidden, &pattern).is_empty());

        let access = ev(EventKind::Access(notify::event::AccessKind::Any), &["/d/a.csv"]);
        assert!(actions_for(&access, &pattern).is_empty());
    }

    fn settings_for(root: &Path) -> WatcherSettings {
        WatcherSettings {
            root: root.to_path_buf(),
            pattern: FilePattern::new("*.csv").unwrap(),
            recursive: false,
            debounce: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_relist_queues_matching_files() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("missed.csv"), "a\n1\n").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(temp_dir.path().join(".partial.csv"), "a\n").unwrap();

        let settings = settings_for(temp_dir.path());
        let mut debouncer = Debouncer::new(settings.debounce);
        let start = Instant::now();
        assert_eq!(relist(&settings, &mut debouncer, start).unwrap(), 1);
        assert!(debouncer.is_pending(&temp_dir.path().join("missed.csv")));

        debouncer.tick(start + Duration::from_millis(1), FileStamp::of);
        let ready = debouncer.tick(start + Duration::from_millis(50), FileStamp::of);
        assert_eq!(ready.len(), 1);

        // Already emitted with the same stamp: a second re-list stays quiet
        relist(&settings, &mut debouncer, start + Duration::from_millis(60)).unwrap();
        debouncer.tick(start + Duration::from_millis(61), FileStamp::of);
        assert!(debouncer.tick(start + Duration::from_millis(120), FileStamp::of).is_empty());
    }

    #[test]
    fn test_relist_of_missing_root_is_detection_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let settings = settings_for(&temp_dir.path().join("gone"));
        let mut debouncer = Debouncer::new(settings.debounce);
        let err = relist(&settings, &mut debouncer, Instant::now()).unwrap_err();
        assert!(matches!(err, DetectionError::Access { .. }));
    }

    #[test]
    fn test_root_removal_is_detected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path().join("drop");
        std::fs::create_dir(&root).unwrap();
        let removed = ev(EventKind::Remove(RemoveKind::Folder), &[root.to_str().unwrap()]);

        // Still there: an unrelated event for the same path
        assert!(!root_gone(&removed, &root));
        std::fs::remove_dir(&root).unwrap();
        assert!(root_gone(&removed, &root));

        let child = ev(EventKind::Remove(RemoveKind::File), &[root.join("a.csv").to_str().unwrap()]);
        assert!(!root_gone(&child, &root));
    }
}
