//! Doubles for exercising sessions without a browser or a disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tether_core::bus::{topic, EventBus, REQUEST_ID_FIELD};
use tether_core::filesystem::FileSystem;
use tether_core::lsp::{LspProxy, ProxyState};
use tether_core::{Error, Result};

use crate::protocol::{action, global};

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, String>>,
    save_as_target: Mutex<Option<PathBuf>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<PathBuf>, text: &str) {
        self.files.lock().insert(path.into(), text.to_string());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    /// Where the next "save as" dialog will point; `None` cancels it.
    pub fn set_save_as_target(&self, path: Option<PathBuf>) {
        *self.save_as_target.lock() = path;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_file(&self, path: &Path) -> Result<String> {
        self.get(path).ok_or_else(|| {
            Error::file_io(path, std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }

    fn save_file(&self, path: &Path, contents: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::file_io(
                path,
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.put(path, contents);
        Ok(())
    }

    fn save_file_as(&self, contents: &str) -> Result<Option<PathBuf>> {
        let Some(path) = self.save_as_target.lock().clone() else {
            return Ok(None);
        };
        self.save_file(&path, contents)?;
        Ok(Some(path))
    }
}

// ---------------------------------------------------------------------------
// Editor content
// ---------------------------------------------------------------------------

/// Stands in for the page hosting the editor: records what the host sends
/// and answers content requests with scripted text.
pub struct FakeEditorContent {
    bus: Arc<EventBus>,
    text: Mutex<String>,
    silent: AtomicBool,
    reply_delay: Mutex<Option<Duration>>,
    log: Mutex<Vec<(String, Value)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEditorContent {
    /// Listen on everything a session in `namespace` sends.
    pub fn attach(bus: &Arc<EventBus>, namespace: &str) -> Arc<Self> {
        let fake = Arc::new(Self {
            bus: bus.clone(),
            text: Mutex::new(String::new()),
            silent: AtomicBool::new(false),
            reply_delay: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let outbound = [
            action::DO_REINITIALIZATION,
            action::SET_CONTENT,
            action::SELECT_AND_REVEAL,
            action::SUBSCRIBE_MODEL_CHANGES,
            action::UNDO,
            action::REDO,
            action::COPY,
            action::CUT,
            action::FIND,
            action::PASTE,
            action::SELECT_ALL,
            action::FILE_PATH_CHANGED,
            action::DID_SAVE,
            action::REPORT_CHANGES,
            action::RELOAD,
        ];
        for name in outbound {
            fake.record_on(topic(namespace, name));
        }
        fake.record_on(global::DO_CREATE_EDITOR.to_string());

        let weak = Arc::downgrade(&fake);
        let request_topic = topic(namespace, action::GET_CONTENTS);
        let reply_topic = topic(namespace, action::DO_GET_CONTENTS);
        bus.on(request_topic.clone(), move |req| {
            if let Some(fake) = weak.upgrade() {
                fake.answer(&request_topic, &reply_topic, req);
            }
        });
        fake
    }

    fn record_on(self: &Arc<Self>, t: String) {
        let weak = Arc::downgrade(self);
        let name = t.clone();
        self.bus.on(t, move |payload| {
            if let Some(fake) = weak.upgrade() {
                fake.log.lock().push((name.clone(), payload));
            }
        });
    }

    /// Also record a topic that is not known up front (`modelResolved<uri>`).
    pub fn listen(self: &Arc<Self>, t: &str) {
        self.record_on(t.to_string());
    }

    fn answer(self: &Arc<Self>, request_topic: &str, reply_topic: &str, req: Value) {
        self.log.lock().push((request_topic.to_string(), req.clone()));
        if self.silent.load(Ordering::SeqCst) {
            return;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = json!({
            "contents": self.text.lock().clone(),
            "requestId": req.get(REQUEST_ID_FIELD).cloned().unwrap_or(Value::Null),
        });
        let delay = *self.reply_delay.lock();
        match delay {
            None => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.bus.send(reply_topic, reply);
            }
            Some(delay) => {
                let fake = self.clone();
                let reply_topic = reply_topic.to_string();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    fake.in_flight.fetch_sub(1, Ordering::SeqCst);
                    fake.bus.send(&reply_topic, reply);
                });
            }
        }
    }

    pub fn set_text(&self, text: &str) {
        *self.text.lock() = text.to_string();
    }

    /// Stop answering content requests.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        *self.reply_delay.lock() = delay;
    }

    /// Payloads received on topics ending with `suffix`, in arrival order.
    pub fn received(&self, suffix: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter(|(t, _)| t.ends_with(suffix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn count(&self, suffix: &str) -> usize {
        self.received(suffix).len()
    }

    /// Every recorded topic, in arrival order.
    pub fn topics(&self) -> Vec<String> {
        self.log.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Fire the page's readiness signal.
    pub fn signal_ready(&self) {
        self.bus.send(global::CREATE_EDITOR, json!({}));
    }
}

// ---------------------------------------------------------------------------
// Language server proxy
// ---------------------------------------------------------------------------

/// Proxy that only tracks its lifecycle.
pub struct CountingProxy {
    port: u16,
    state: Mutex<ProxyState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl CountingProxy {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            state: Mutex::new(ProxyState::Stopped),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LspProxy for CountingProxy {
    fn start(&self) {
        let mut state = self.state.lock();
        if *state == ProxyState::Stopped {
            *state = ProxyState::Running;
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if *state != ProxyState::Stopped {
            *state = ProxyState::Stopped;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    fn port(&self) -> u16 {
        self.port
    }
}
