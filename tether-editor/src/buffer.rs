use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long after a save a file change matching the saved text is treated as
/// the echo of that save.
pub const OWN_WRITE_WINDOW: Duration = Duration::from_secs(2);

struct OwnWrite {
    text: String,
    at: Instant,
}

/// What the host document and the file watcher last agreed on, plus a guard
/// that mutes self-inflicted change notifications.
///
/// While a [`SuppressGuard`] is alive the session is itself writing the file
/// or pushing editor text into the host document, so "the file changed" and
/// "the document changed" callbacks are echoes and must be ignored. File
/// watch events arrive after the write has returned, so the last written text
/// is also kept for [`OWN_WRITE_WINDOW`].
#[derive(Default)]
pub struct FileBufferState {
    own_document: Mutex<Option<String>>,
    last_write: Mutex<Option<OwnWrite>>,
    suppress_depth: AtomicUsize,
}

impl FileBufferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mute self-triggered notifications until the guard is dropped. Guards nest.
    pub fn suppress(self: &Arc<Self>) -> SuppressGuard {
        self.suppress_depth.fetch_add(1, Ordering::SeqCst);
        SuppressGuard {
            state: self.clone(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_depth.load(Ordering::SeqCst) > 0
    }

    pub fn set_own_document(&self, text: String) {
        *self.own_document.lock() = Some(text);
    }

    /// Remember text the session just wrote to the backing file.
    pub fn record_write(&self, text: &str, now: Instant) {
        *self.last_write.lock() = Some(OwnWrite {
            text: text.to_string(),
            at: now,
        });
    }

    /// True when `disk` is what the session wrote less than
    /// [`OWN_WRITE_WINDOW`] ago. Different disk text forgets the record.
    pub fn is_own_write(&self, disk: &str, now: Instant) -> bool {
        let mut last = self.last_write.lock();
        let Some(write) = last.as_ref() else {
            return false;
        };
        if now.duration_since(write.at) > OWN_WRITE_WINDOW {
            *last = None;
            return false;
        }
        if write.text.trim() != disk.trim() {
            *last = None;
            return false;
        }
        true
    }

    /// True when `text` is what the host document already holds, i.e. a
    /// change notification carrying it is an echo of our own update.
    pub fn is_echo(&self, text: &str) -> bool {
        self.own_document.lock().as_deref() == Some(text)
    }
}

pub struct SuppressGuard {
    state: Arc<FileBufferState>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.state.suppress_depth.fetch_sub(1, Ordering::SeqCst);
    }
}
