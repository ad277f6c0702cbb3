//! Named-topic message bus shared by the native host and the embedded editor.
//!
//! Every topic has at most one handler. Registering a handler for a topic that
//! already has one replaces it. Messages sent to a topic without a handler are
//! dropped; that is normal during start-up and teardown, so it is only traced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Field carrying the correlation id on requests and replies.
pub const REQUEST_ID_FIELD: &str = "requestId";

/// Build a namespaced topic: `<namespace>_<action>`.
pub fn topic(namespace: &str, action: &str) -> String {
    format!("{}_{}", namespace, action)
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous handler.
    pub fn on<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let previous = self.handlers.write().insert(topic.clone(), Arc::new(handler));
        if previous.is_some() {
            log::trace!("bus: replaced handler for '{}'", topic);
        }
    }

    pub fn off(&self, topic: &str) -> bool {
        self.handlers.write().remove(topic).is_some()
    }

    /// Remove every handler whose topic starts with `prefix`. Returns how many were removed.
    pub fn off_prefix(&self, prefix: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|topic, _| !topic.starts_with(prefix));
        before - handlers.len()
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.read().contains_key(topic)
    }

    /// Fire-and-forget delivery. The handler runs on the calling thread after
    /// the registry lock has been released.
    pub fn send(&self, topic: &str, payload: Value) {
        if let Err(e) = self.try_send(topic, payload) {
            log::trace!("bus: {}", e);
        }
    }

    /// Send a message that carries no payload.
    pub fn send_empty(&self, topic: &str) {
        self.send(topic, Value::Null);
    }

    /// Serialize `payload` and send it. Serialization failures are logged.
    pub fn send_json<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(topic, value),
            Err(e) => log::error!("bus: failed to serialize payload for '{}': {}", topic, e),
        }
    }

    /// Like [`send`](Self::send) but reports a missing listener.
    pub fn try_send(&self, topic: &str, payload: Value) -> Result<()> {
        let handler = self.handlers.read().get(topic).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                Ok(())
            }
            None => Err(Error::TransportDropped {
                topic: topic.to_string(),
            }),
        }
    }
}

enum ReplySlot {
    Channel(Sender<Value>),
    Callback(Box<dyn FnOnce(Value) + Send>),
}

impl ReplySlot {
    fn deliver(self, value: Value) {
        match self {
            ReplySlot::Channel(tx) => {
                let _ = tx.send(value);
            }
            ReplySlot::Callback(f) => f(value),
        }
    }
}

#[derive(Default)]
struct PendingReplies {
    next_id: u64,
    waiting: VecDeque<(u64, ReplySlot)>,
}

impl PendingReplies {
    fn take(&mut self, id: Option<u64>) -> Option<ReplySlot> {
        let index = match id {
            Some(id) => self.waiting.iter().position(|(pending, _)| *pending == id)?,
            None if self.waiting.is_empty() => return None,
            None => 0,
        };
        self.waiting.remove(index).map(|(_, slot)| slot)
    }
}

/// Request/reply correlation over a pair of topics.
///
/// Each request carries a `requestId`; the reply handler routes the answer to
/// the matching single-shot slot. Replies without an id go to the oldest
/// outstanding request, which keeps content that does not echo ids working.
pub struct RequestChannel {
    bus: Arc<EventBus>,
    request_topic: String,
    reply_topic: String,
    pending: Arc<Mutex<PendingReplies>>,
}

impl RequestChannel {
    pub fn new(
        bus: Arc<EventBus>,
        request_topic: impl Into<String>,
        reply_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            request_topic: request_topic.into(),
            reply_topic: reply_topic.into(),
            pending: Arc::new(Mutex::new(PendingReplies::default())),
        }
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Number of requests still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().waiting.len()
    }

    /// Issue a request and return a handle to wait on its reply.
    pub fn request(&self, params: Value) -> PendingReply {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.dispatch(params, ReplySlot::Channel(tx));
        PendingReply {
            id,
            rx,
            pending: self.pending.clone(),
        }
    }

    /// Issue a request whose reply is handed to `on_reply` on the replying thread.
    pub fn request_with<F>(&self, params: Value, on_reply: F) -> u64
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.dispatch(params, ReplySlot::Callback(Box::new(on_reply)))
    }

    /// Drop every outstanding request and stop listening for replies.
    pub fn close(&self) {
        self.bus.off(&self.reply_topic);
        let dropped = std::mem::take(&mut self.pending.lock().waiting);
        if !dropped.is_empty() {
            log::debug!(
                "bus: closing '{}' with {} unanswered request(s)",
                self.request_topic,
                dropped.len()
            );
        }
    }

    fn dispatch(&self, params: Value, slot: ReplySlot) -> u64 {
        // Another party may have replaced the reply handler since the last request.
        self.install_reply_handler();

        let id = {
            let mut pending = self.pending.lock();
            pending.next_id += 1;
            let id = pending.next_id;
            pending.waiting.push_back((id, slot));
            id
        };

        let mut payload = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("params".to_string(), other);
                map
            }
        };
        payload.insert(REQUEST_ID_FIELD.to_string(), Value::from(id));
        self.bus.send(&self.request_topic, Value::Object(payload));
        id
    }

    fn install_reply_handler(&self) {
        let pending = self.pending.clone();
        let reply_topic = self.reply_topic.clone();
        self.bus.on(self.reply_topic.clone(), move |value: Value| {
            let id = value.get(REQUEST_ID_FIELD).and_then(Value::as_u64);
            let slot = pending.lock().take(id);
            match slot {
                Some(slot) => slot.deliver(value),
                None => log::debug!("bus: unmatched reply on '{}' (id {:?})", reply_topic, id),
            }
        });
    }
}

/// Single-shot handle for one outstanding request.
pub struct PendingReply {
    id: u64,
    rx: Receiver<Value>,
    pending: Arc<Mutex<PendingReplies>>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the reply arrives or `timeout` expires. An expired request
    /// is withdrawn so a late reply is discarded rather than misrouted.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                self.cancel();
                Err(Error::content_unavailable(format!(
                    "no reply to request {} within {:?}",
                    self.id, timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::content_unavailable(format!(
                "request {} was cancelled",
                self.id
            ))),
        }
    }

    fn cancel(&self) {
        let _ = self.pending.lock().take(Some(self.id));
    }
}
