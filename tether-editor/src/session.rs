//! One editor instance: its namespace on the bus, the file it edits, the
//! language server it talks to, and everything that keeps those in sync.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::bus::{topic, EventBus};
use tether_core::config::BridgeConfig;
use tether_core::filesystem::FileSystem;
use tether_core::lsp::{LspEndpoint, LspRegistry};
use tether_core::util::{
    file_name, normalize_file_path, parent_dir, root_uri, uri_to_file_path,
};
use tether_core::{Error, Result};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::buffer::FileBufferState;
use crate::content::ContentSync;
use crate::load_state::{LoadGate, LoadState};
use crate::protocol::{
    action, global, ChangesNotification, CreateEditorPayload, CreateEditorRequest,
    FilePathChangedPayload, GetContentOfRequest, ReinitializePayload, SelectAndRevealPayload,
    Selection, SetContentPayload,
};
use crate::watcher::{FileChange, FileWatcher, WatchState};

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DirtyChanged(bool),
    UndoAvailable(bool),
    RedoAvailable(bool),
    ContentChanged(String),
    SelectionChanged { offset: u32, length: u32 },
    FilePathChanged { file_path: String, file_name: String },
    Saved { path: PathBuf },
    /// The user should be told the file could not be saved.
    SaveFailed { path: Option<PathBuf>, message: String },
    RenameRequested,
    FindReferencesRequested,
    /// The editor wants the text of another file; answer with
    /// [`EditorSession::send_model`].
    ModelRequested { uri: String },
    Disposed,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SessionBuilder {
    contents: String,
    file_path: Option<String>,
    root_path: Option<String>,
    lsp: Option<LspEndpoint>,
    events: Option<UnboundedSender<SessionEvent>>,
    config: Option<BridgeConfig>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(mut self, contents: impl Into<String>) -> Self {
        self.contents = contents.into();
        self
    }

    /// Plain path or `file:` URI.
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_root_path(mut self, root: impl Into<String>) -> Self {
        self.root_path = Some(root.into());
        self
    }

    /// Use this language server instead of resolving one from the registry.
    pub fn with_lsp(mut self, lsp: LspEndpoint) -> Self {
        self.lsp = Some(lsp);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Create the session and wait for the editor's readiness signal on `bus`.
    pub fn create(
        self,
        bus: Arc<EventBus>,
        fs: Arc<dyn FileSystem>,
        registry: Arc<LspRegistry>,
    ) -> Arc<EditorSession> {
        let config = self.config.unwrap_or_default();
        let namespace = format!("editor{}", Uuid::new_v4().simple());

        let session = Arc::new_cyclic(|me: &Weak<EditorSession>| {
            let on_change = me.clone();
            EditorSession {
                content: ContentSync::new(bus.clone(), &namespace, config.sync_fetch_timeout()),
                watcher: FileWatcher::new(config.move_window(), move |change| {
                    if let Some(session) = on_change.upgrade() {
                        session.handle_file_change(change);
                    }
                }),
                me: me.clone(),
                namespace,
                bus,
                fs,
                registry,
                events: self.events,
                state: Mutex::new(SessionState::default()),
                gate: LoadGate::new(),
                buffer: Arc::new(FileBufferState::new()),
                disposed: AtomicBool::new(false),
            }
        });

        session.register_actions();
        session.create_editor(self.contents, self.file_path, self.root_path, self.lsp);
        log::info!("created editor session {}", session.namespace);
        session
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    file_path: String,
    file_name: String,
    root_path: Option<String>,
    lsp: Option<LspEndpoint>,
    /// The binding came from the host and must not be re-resolved.
    explicit_lsp: bool,
    initial_content: String,
}

pub struct EditorSession {
    me: Weak<EditorSession>,
    namespace: String,
    bus: Arc<EventBus>,
    fs: Arc<dyn FileSystem>,
    registry: Arc<LspRegistry>,
    events: Option<UnboundedSender<SessionEvent>>,
    state: Mutex<SessionState>,
    gate: LoadGate,
    content: ContentSync,
    buffer: Arc<FileBufferState>,
    watcher: FileWatcher,
    disposed: AtomicBool,
}

fn stop_endpoint(endpoint: &LspEndpoint) {
    if let Some(proxy) = endpoint.proxy() {
        proxy.stop();
    }
}

impl EditorSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    // -- accessors ----------------------------------------------------------

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn file_path(&self) -> String {
        self.state.lock().file_path.clone()
    }

    pub fn file_name(&self) -> String {
        self.state.lock().file_name.clone()
    }

    pub fn root_path(&self) -> Option<String> {
        self.state.lock().root_path.clone()
    }

    pub fn lsp_path(&self) -> Option<String> {
        self.state.lock().lsp.as_ref().map(LspEndpoint::lsp_path)
    }

    pub fn load_state(&self) -> LoadState {
        self.gate.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.gate.is_loaded()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> WatchState {
        self.watcher.state()
    }

    fn topic(&self, action: &str) -> String {
        topic(&self.namespace, action)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Handle `action` in this namespace while the session is alive.
    fn on_inbound<F>(&self, action: &str, handler: F)
    where
        F: Fn(&Arc<EditorSession>, Value) + Send + Sync + 'static,
    {
        let me = self.me.clone();
        let name = self.topic(action);
        self.bus.on(name.clone(), move |payload| {
            let Some(session) = me.upgrade() else { return };
            if session.is_disposed() {
                log::debug!("ignoring '{}' after dispose", name);
                return;
            }
            handler(&session, payload);
        });
    }

    // -- creation -----------------------------------------------------------

    fn register_actions(&self) {
        self.on_inbound(action::DISPOSE_EDITOR, |s, _| s.dispose());
        self.on_inbound(action::DO_SAVE_AS, |s, _| s.save_as());
        self.on_inbound(action::DO_SAVE, |s, _| s.save());
        self.on_inbound(action::DO_RELOAD, |s, _| s.reload());
    }

    fn create_editor(
        &self,
        contents: String,
        file_path: Option<String>,
        root_path: Option<String>,
        lsp: Option<LspEndpoint>,
    ) {
        self.content.set_last_known(contents.clone());
        {
            let mut state = self.state.lock();
            state.initial_content = contents;
            state.root_path = root_path;
            state.explicit_lsp = lsp.is_some();
            state.lsp = lsp;
        }
        if let Some(path) = file_path.filter(|p| !p.trim().is_empty()) {
            self.set_file_path(&normalize_file_path(&path));
        }

        let me = self.me.clone();
        self.bus.on(global::CREATE_EDITOR, move |payload| {
            let Some(session) = me.upgrade() else { return };
            if session.is_disposed() {
                return;
            }
            let request: CreateEditorRequest = serde_json::from_value(payload).unwrap_or_default();
            if let Some(path) = request.file_path.filter(|p| !p.trim().is_empty()) {
                if session.file_path().is_empty() {
                    session.set_file_path(&normalize_file_path(&path));
                }
            }
            session.handle_create_editor();
        });
    }

    /// Send the editor its model and language server, then replay whatever
    /// was queued while it was loading.
    pub fn handle_create_editor(&self) {
        let (payload, proxy, replaced) = {
            let mut state = self.state.lock();
            let mut replaced = None;
            if !state.explicit_lsp {
                replaced = state.lsp.take();
                let resolved = self.registry.resolve_for_file(&state.file_name);
                state.lsp = resolved;
            }
            let payload = CreateEditorPayload {
                text: state.initial_content.clone(),
                name: state.file_path.clone(),
                namespace: self.namespace.clone(),
                lsp_path: state.lsp.as_ref().map(LspEndpoint::lsp_path),
                bind_eclipse_lsp: state.explicit_lsp,
                root_uri: state.root_path.as_deref().map(root_uri),
            };
            let proxy = state.lsp.as_ref().and_then(|l| l.proxy().cloned());
            (payload, proxy, replaced)
        };

        if let Some(old) = replaced {
            stop_endpoint(&old);
        }
        if let Some(proxy) = proxy {
            proxy.start();
        }
        log::debug!(
            "creating editor {} for '{}' (lsp: {:?})",
            self.namespace,
            payload.name,
            payload.lsp_path
        );
        self.bus.send_json(global::DO_CREATE_EDITOR, &payload);
        self.gate.mark_loaded();
    }

    /// Create the editor now instead of waiting for its readiness signal.
    pub fn initialize(&self, contents: &str, file_name: &str, file_path: &str) {
        self.content.set_last_known(contents);
        self.state.lock().initial_content = contents.to_string();
        if !file_path.trim().is_empty() {
            self.set_file_path(&normalize_file_path(file_path));
        }
        if !file_name.is_empty() {
            self.state.lock().file_name = file_name.to_string();
        }
        self.handle_create_editor();
    }

    /// Point an existing editor at new content, file and language server.
    pub fn reinitialize(
        &self,
        content: &str,
        file_path: &str,
        root_path: Option<String>,
        lsp: Option<LspEndpoint>,
    ) {
        let path = normalize_file_path(file_path);
        self.set_file_path(&path);

        let (payload, old, proxy) = {
            let mut state = self.state.lock();
            let old = state.lsp.take();
            state.explicit_lsp = lsp.is_some();
            let resolved = match lsp {
                Some(lsp) => Some(lsp),
                None => self.registry.resolve_for_file(&state.file_name),
            };
            state.lsp = resolved;
            state.root_path = root_path;
            let payload = ReinitializePayload {
                text: content.to_string(),
                name: state.file_path.clone(),
                lsp_path: state.lsp.as_ref().map(LspEndpoint::lsp_path),
                root_uri: state.root_path.as_deref().map(root_uri),
            };
            let proxy = state.lsp.as_ref().and_then(|l| l.proxy().cloned());
            (payload, old, proxy)
        };

        if let Some(old) = old {
            stop_endpoint(&old);
        }
        if let Some(proxy) = proxy {
            proxy.start();
        }
        self.content.set_last_known(content);
        log::info!("reinitializing editor {} for '{}'", self.namespace, payload.name);
        self.bus
            .send_json(&self.topic(action::DO_REINITIALIZATION), &payload);
    }

    pub fn set_file_path(&self, path: &str) {
        let name = file_name(path);
        {
            let mut state = self.state.lock();
            state.file_path = path.to_string();
            state.file_name = name.clone();
        }
        if !path.trim().is_empty() {
            if let Err(e) = self.watcher.bind(Path::new(path)) {
                log::warn!("not watching '{}': {}", path, e);
            }
        }

        self.bus.send_json(
            &self.topic(action::FILE_PATH_CHANGED),
            &FilePathChangedPayload {
                file_path: path.to_string(),
                file_name: name.clone(),
            },
        );
        self.emit(SessionEvent::FilePathChanged {
            file_path: path.to_string(),
            file_name: name,
        });
    }

    // -- content ------------------------------------------------------------

    /// Current editor text; before the editor has loaded, the initial content.
    pub fn contents_async<F>(&self, on_contents: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        if !self.gate.is_loaded() {
            on_contents(self.state.lock().initial_content.clone());
            return;
        }
        self.content.fetch_async(on_contents);
    }

    /// Blocking read of the editor text that never fails: if the editor does
    /// not answer in time, or another blocking read is running, the last
    /// known text is returned.
    pub fn contents_sync(&self) -> String {
        match self.try_contents_sync() {
            Ok(text) => text,
            Err(e) => {
                log::debug!("serving last known content for {}: {}", self.namespace, e);
                self.content.last_known()
            }
        }
    }

    pub fn try_contents_sync(&self) -> Result<String> {
        if !self.gate.is_loaded() {
            return Ok(self.state.lock().initial_content.clone());
        }
        self.content.fetch_sync()
    }

    pub fn set_content(&self, content: &str, as_edit: bool) {
        let me = self.me.clone();
        let payload = SetContentPayload {
            content: content.to_string(),
            as_edit,
        };
        self.gate.run_or_defer(move || {
            let Some(session) = me.upgrade() else { return };
            session.content.set_last_known(payload.content.clone());
            session
                .bus
                .send_json(&session.topic(action::SET_CONTENT), &payload);
        });
    }

    pub fn select_and_reveal(&self, offset: u32, length: u32) {
        let bus = self.bus.clone();
        let topic = self.topic(action::SELECT_AND_REVEAL);
        self.gate.run_or_defer(move || {
            bus.send_json(&topic, &SelectAndRevealPayload { offset, length });
        });
    }

    /// Mirror edits made on the host side into the editor.
    pub fn host_document_changed(&self, text: &str) {
        if self.buffer.is_suppressed() || self.buffer.is_echo(text) {
            log::trace!("host document echo ignored for {}", self.namespace);
            return;
        }
        self.buffer.set_own_document(text.to_string());
        self.set_content(text, true);
    }

    pub fn subscribe_changes(&self) {
        self.on_inbound(action::CHANGES_NOTIFICATION, |s, payload| {
            s.changes_notified(payload)
        });
        let bus = self.bus.clone();
        let topic = self.topic(action::SUBSCRIBE_MODEL_CHANGES);
        self.gate.run_or_defer(move || bus.send_empty(&topic));
    }

    fn changes_notified(&self, payload: Value) {
        let notification: ChangesNotification = match serde_json::from_value(payload) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("malformed changes notification: {}", e);
                return;
            }
        };
        self.emit(SessionEvent::DirtyChanged(notification.is_dirty));
        self.emit(SessionEvent::UndoAvailable(notification.can_undo));
        self.emit(SessionEvent::RedoAvailable(notification.can_redo));

        if let Some(content) = notification.content {
            self.content.set_last_known(content.clone());
            let _guard = self.buffer.suppress();
            self.buffer.set_own_document(content.clone());
            self.emit(SessionEvent::ContentChanged(content));
        }
    }

    pub fn config_selection(&self) {
        self.on_inbound(action::SELECTION, |s, payload| {
            match serde_json::from_value::<Selection>(payload) {
                Ok(selection) => {
                    let (offset, length) = selection.to_offset_length(&s.content.last_known());
                    s.emit(SessionEvent::SelectionChanged { offset, length });
                }
                Err(e) => log::warn!("malformed selection: {}", e),
            }
        });
    }

    pub fn config_rename(&self) {
        self.on_inbound(action::MAKE_RENAME, |s, _| {
            s.emit(SessionEvent::RenameRequested)
        });
    }

    pub fn config_find_all_references(&self) {
        self.on_inbound(action::FIND_ALL_REFERENCES, |s, _| {
            s.emit(SessionEvent::FindReferencesRequested)
        });
    }

    /// Answer the editor's requests for other files' text. Without an event
    /// sink the files are read straight from the file system.
    pub fn config_get_model(&self) {
        self.on_inbound(action::GET_CONTENT_OF, |s, payload| {
            let request: GetContentOfRequest = match serde_json::from_value(payload) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("malformed model request: {}", e);
                    return;
                }
            };
            if s.events.is_some() {
                s.emit(SessionEvent::ModelRequested { uri: request.path });
            } else {
                s.send_model(&request.path, None);
            }
        });
    }

    /// Resolve the model for `uri`, reading the file when `content` is `None`.
    pub fn send_model(&self, uri: &str, content: Option<String>) {
        let text = match content {
            Some(text) => text,
            None => match self.fs.read_file(Path::new(&uri_to_file_path(uri))) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("cannot resolve model {}: {}", uri, e);
                    return;
                }
            },
        };
        let topic = self.topic(&format!("{}{}", action::MODEL_RESOLVED, uri));
        self.bus.send(&topic, Value::String(text));
    }

    // -- editor actions -----------------------------------------------------

    fn send_action(&self, action: &str) {
        self.bus.send_empty(&self.topic(action));
    }

    pub fn undo(&self) {
        self.send_action(action::UNDO);
    }

    pub fn redo(&self) {
        self.send_action(action::REDO);
    }

    pub fn copy(&self) {
        self.send_action(action::COPY);
    }

    pub fn cut(&self) {
        self.send_action(action::CUT);
    }

    pub fn find(&self) {
        self.send_action(action::FIND);
    }

    pub fn paste(&self) {
        self.send_action(action::PASTE);
    }

    pub fn select_all(&self) {
        self.send_action(action::SELECT_ALL);
    }

    // -- files --------------------------------------------------------------

    pub fn save(&self) {
        let path = self.file_path();
        if path.trim().is_empty() {
            self.save_as();
            return;
        }
        let me = self.me.clone();
        self.contents_async(move |text| {
            if let Some(session) = me.upgrade() {
                session.write_file(PathBuf::from(path), text);
            }
        });
    }

    pub fn save_as(&self) {
        let me = self.me.clone();
        self.contents_async(move |text| {
            if let Some(session) = me.upgrade() {
                session.write_file_as(text);
            }
        });
    }

    fn write_file(&self, path: PathBuf, text: String) {
        let result = {
            let _guard = self.buffer.suppress();
            self.buffer.record_write(&text, Instant::now());
            self.fs.save_file(&path, &text)
        };
        match result {
            Ok(()) => self.after_save(path),
            Err(e) => self.save_failed(Some(path), e),
        }
    }

    fn write_file_as(&self, text: String) {
        let result = {
            let _guard = self.buffer.suppress();
            self.buffer.record_write(&text, Instant::now());
            self.fs.save_file_as(&text)
        };
        match result {
            Ok(Some(path)) => {
                self.set_file_path(&path.to_string_lossy());
                self.after_save(path);
            }
            Ok(None) => log::debug!("save as cancelled for {}", self.namespace),
            Err(e) => self.save_failed(None, e),
        }
    }

    fn after_save(&self, path: PathBuf) {
        log::info!("saved {}", path.display());
        self.send_action(action::DID_SAVE);
        self.emit(SessionEvent::Saved { path });
    }

    fn save_failed(&self, path: Option<PathBuf>, error: Error) {
        log::error!("could not save: {}", error);
        self.emit(SessionEvent::SaveFailed {
            path,
            message: error.to_string(),
        });
    }

    /// Replace the editor text with what is on disk.
    pub fn reload(&self) {
        let path = self.file_path();
        if path.trim().is_empty() {
            log::debug!("nothing to reload for {}", self.namespace);
            return;
        }
        match self.fs.read_file(Path::new(&path)) {
            Ok(text) => {
                self.content.set_last_known(text.clone());
                self.bus.send(&self.topic(action::RELOAD), Value::String(text));
            }
            Err(e) => log::warn!("reload failed: {}", e),
        }
    }

    /// React to a change of the backing file made outside the editor.
    pub fn handle_file_change(&self, change: FileChange) {
        if self.is_disposed() {
            return;
        }
        match change {
            FileChange::Modified => self.report_changes(),
            FileChange::Moved(to) => self.file_moved(&to),
        }
    }

    fn report_changes(&self) {
        if self.buffer.is_suppressed() {
            log::trace!("ignoring change caused by our own write");
            return;
        }
        if !self.gate.is_loaded() {
            log::debug!("file changed before editor {} loaded", self.namespace);
            return;
        }
        let me = self.me.clone();
        self.content.fetch_async(move |editor_text| {
            if let Some(session) = me.upgrade() {
                session.reconcile(&editor_text);
            }
        });
    }

    fn reconcile(&self, editor_text: &str) {
        if self.buffer.is_suppressed() || self.is_disposed() {
            return;
        }
        let path = self.file_path();
        let differs = match self.fs.read_file(Path::new(&path)) {
            Ok(disk) if self.buffer.is_own_write(&disk, Instant::now()) => {
                log::trace!("'{}' still holds our last save", path);
                false
            }
            Ok(disk) => disk.trim() != editor_text.trim(),
            Err(e) => {
                log::debug!("{}", e);
                true
            }
        };
        if differs {
            log::info!("'{}' changed outside the editor", path);
            self.send_action(action::REPORT_CHANGES);
        }
    }

    fn file_moved(&self, to: &Path) {
        let new_path = to.to_string_lossy().into_owned();
        let root = match self.root_path() {
            Some(root) if to.starts_with(&root) => Some(root),
            _ => parent_dir(to).map(|p| p.to_string_lossy().into_owned()),
        };
        log::info!("'{}' moved to '{}'", self.file_path(), new_path);

        let me = self.me.clone();
        self.contents_async(move |text| {
            if let Some(session) = me.upgrade() {
                session.reinitialize(&text, &new_path, root, None);
            }
        });
    }

    // -- teardown -----------------------------------------------------------

    /// Release the language server, the watch and the bus handlers. Safe to
    /// call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let lsp = self.state.lock().lsp.take();
        if let Some(endpoint) = lsp {
            stop_endpoint(&endpoint);
        }
        self.watcher.stop();
        self.content.close();
        let removed = self.bus.off_prefix(&format!("{}_", self.namespace));
        self.emit(SessionEvent::Disposed);
        log::info!(
            "disposed editor {} ({} handlers removed)",
            self.namespace,
            removed
        );
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
