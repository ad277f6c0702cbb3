//! External-change detection for the file backing an editor.
//!
//! The watch is placed on the parent directory and filtered by file name, so
//! moves and delete-then-create saves are seen as well as in-place writes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tether_core::util::parent_dir;
use tether_core::{Error, Result};

/// Bursts of raw events closer together than this are reported once.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Contents changed, or the file was deleted.
    Modified,
    /// The file now lives at this path.
    Moved(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
    Rebinding,
    Stopped,
}

pub type ChangeHandler = Arc<dyn Fn(FileChange) + Send + Sync>;

// ---------------------------------------------------------------------------
// Event classification
// ---------------------------------------------------------------------------

/// Turns raw directory events into changes of one watched file.
pub struct EventClassifier {
    file_name: OsString,
    move_window: Duration,
    pending_removal: Option<Instant>,
    pending_rename_from: Option<Instant>,
    last_move: Option<PathBuf>,
}

impl EventClassifier {
    pub fn new(file_name: impl Into<OsString>, move_window: Duration) -> Self {
        Self {
            file_name: file_name.into(),
            move_window,
            pending_removal: None,
            pending_rename_from: None,
            last_move: None,
        }
    }

    fn is_watched(&self, path: &Path) -> bool {
        path.file_name() == Some(self.file_name.as_os_str())
    }

    fn within_window(&self, since: Option<Instant>, now: Instant) -> bool {
        since.is_some_and(|t| now.duration_since(t) <= self.move_window)
    }

    /// Candidate move target, checked against the disk.
    fn moved_to(&mut self, to: &Path) -> Option<FileChange> {
        if self.last_move.as_deref() == Some(to) {
            return None;
        }
        if !to.is_file() {
            let err = Error::RenameRace {
                from: PathBuf::from(&self.file_name),
                to: to.to_path_buf(),
            };
            log::warn!("{}", err);
            return None;
        }
        self.last_move = Some(to.to_path_buf());
        Some(FileChange::Moved(to.to_path_buf()))
    }

    /// When a rename away from the watched name has to be resolved by, if one
    /// is waiting for its other half.
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending_rename_from.map(|t| t + self.move_window)
    }

    /// A rename whose target never showed up took the file out of the watched
    /// directory. To the editor that is the same as a delete.
    pub fn expire(&mut self, now: Instant) -> Option<FileChange> {
        let deadline = self.pending_deadline()?;
        if now < deadline {
            return None;
        }
        self.pending_rename_from = None;
        Some(FileChange::Modified)
    }

    pub fn classify(&mut self, event: &Event, now: Instant) -> Option<FileChange> {
        let first = event.paths.first()?;
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let to = event.paths.get(1)?;
                self.pending_rename_from = None;
                if self.is_watched(first) && !self.is_watched(to) {
                    self.moved_to(to)
                } else if self.is_watched(to) {
                    // Something was renamed over the file (atomic save).
                    Some(FileChange::Modified)
                } else {
                    None
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if self.is_watched(first) {
                    self.pending_rename_from = Some(now);
                }
                None
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if self.is_watched(first) {
                    Some(FileChange::Modified)
                } else {
                    let from = self.pending_rename_from.take();
                    if self.within_window(from, now) {
                        self.moved_to(first)
                    } else {
                        None
                    }
                }
            }
            EventKind::Create(_) => {
                if self.is_watched(first) {
                    self.pending_removal = None;
                    Some(FileChange::Modified)
                } else if self.within_window(self.pending_removal, now) {
                    self.pending_removal = None;
                    self.moved_to(first)
                } else {
                    None
                }
            }
            EventKind::Remove(_) if self.is_watched(first) => {
                self.pending_removal = Some(now);
                Some(FileChange::Modified)
            }
            EventKind::Modify(_) if self.is_watched(first) => Some(FileChange::Modified),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

struct ActiveWatch {
    path: PathBuf,
    // Dropping the watcher closes the event channel and ends the thread.
    _watcher: RecommendedWatcher,
    live: Arc<AtomicBool>,
}

struct Inner {
    state: WatchState,
    active: Option<ActiveWatch>,
}

/// Watches one file at a time and reports its changes to a handler.
///
/// Each bound path gets its own event thread. The handler may call back
/// into [`FileWatcher::bind`] (a move rebinds from inside the handler).
pub struct FileWatcher {
    handler: ChangeHandler,
    move_window: Duration,
    inner: Mutex<Inner>,
}

impl FileWatcher {
    pub fn new<F>(move_window: Duration, handler: F) -> Self
    where
        F: Fn(FileChange) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            move_window,
            inner: Mutex::new(Inner {
                state: WatchState::Idle,
                active: None,
            }),
        }
    }

    pub fn state(&self) -> WatchState {
        self.inner.lock().state
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|a| a.path.clone())
    }

    /// Watch `path` instead of whatever was watched before.
    pub fn bind(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == WatchState::Stopped {
            log::debug!("watcher stopped; not binding {}", path.display());
            return Ok(());
        }
        if let Some(old) = inner.active.take() {
            old.live.store(false, Ordering::SeqCst);
            inner.state = WatchState::Rebinding;
        }

        match self.start_watch(path) {
            Ok(active) => {
                log::debug!("watching {}", path.display());
                inner.active = Some(active);
                inner.state = WatchState::Watching;
                Ok(())
            }
            Err(e) => {
                inner.state = WatchState::Idle;
                Err(e)
            }
        }
    }

    fn start_watch(&self, path: &Path) -> Result<ActiveWatch> {
        let not_found = |reason: &str| {
            Error::file_io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, reason.to_string()),
            )
        };
        let file_name = path.file_name().ok_or_else(|| not_found("no file name"))?;
        let dir = parent_dir(path).ok_or_else(|| not_found("no parent directory"))?;

        let (tx, rx) = crossbeam_channel::unbounded::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| Error::file_io(path, std::io::Error::other(e.to_string())))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::file_io(&dir, std::io::Error::other(e.to_string())))?;

        let live = Arc::new(AtomicBool::new(true));
        let mut classifier = EventClassifier::new(file_name, self.move_window);
        let handler = self.handler.clone();
        let thread_live = live.clone();
        std::thread::Builder::new()
            .name(format!("file-watch-{}", file_name.to_string_lossy()))
            .spawn(move || {
                loop {
                    let first = match classifier.pending_deadline() {
                        Some(deadline) => match rx.recv_deadline(deadline) {
                            Ok(res) => Some(res),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(res) => Some(res),
                            Err(_) => break,
                        },
                    };
                    let mut modified = false;
                    let mut moves = Vec::new();
                    let mut next = first;
                    // Drain the burst before reporting.
                    while let Some(res) = next {
                        match res {
                            Ok(event) => match classifier.classify(&event, Instant::now()) {
                                Some(FileChange::Modified) => modified = true,
                                Some(moved) => moves.push(moved),
                                None => {}
                            },
                            Err(e) => log::warn!("file watch error: {}", e),
                        }
                        next = rx.recv_timeout(COALESCE_WINDOW).ok();
                    }
                    if classifier.expire(Instant::now()).is_some() {
                        modified = true;
                    }

                    if !thread_live.load(Ordering::SeqCst) {
                        break;
                    }
                    // A move supersedes any modification seen in the same burst.
                    if let Some(moved) = moves.pop() {
                        handler(moved);
                    } else if modified {
                        handler(FileChange::Modified);
                    }
                }
                log::trace!("file watch thread exiting");
            })
            .map_err(|e| Error::file_io(path, e))?;

        Ok(ActiveWatch {
            path: path.to_path_buf(),
            _watcher: watcher,
            live,
        })
    }

    /// Release the watch. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == WatchState::Stopped {
            return;
        }
        if let Some(active) = inner.active.take() {
            active.live.store(false, Ordering::SeqCst);
            log::debug!("stopped watching {}", active.path.display());
        }
        inner.state = WatchState::Stopped;
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
