//! Fetching the current editor text over the bus.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::bus::{topic, EventBus, RequestChannel};
use tether_core::{Error, Result};

use crate::protocol::{action, ContentsReply};

fn parse_reply(value: Value) -> Result<String> {
    Ok(serde_json::from_value::<ContentsReply>(value)?.contents)
}

/// Content retrieval for one editor namespace.
///
/// Asynchronous fetches never block. Synchronous fetches hold a single
/// permit: a second caller does not queue behind the first, it gets
/// `ContentUnavailable` straight away and no extra request is sent. A holder
/// of the permit waits at most `timeout` for the reply.
pub struct ContentSync {
    requests: RequestChannel,
    permit: Mutex<()>,
    timeout: Duration,
    last_known: Arc<Mutex<String>>,
}

impl ContentSync {
    pub fn new(bus: Arc<EventBus>, namespace: &str, timeout: Duration) -> Self {
        Self {
            requests: RequestChannel::new(
                bus,
                topic(namespace, action::GET_CONTENTS),
                topic(namespace, action::DO_GET_CONTENTS),
            ),
            permit: Mutex::new(()),
            timeout,
            last_known: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn last_known(&self) -> String {
        self.last_known.lock().clone()
    }

    pub fn set_last_known(&self, text: impl Into<String>) {
        *self.last_known.lock() = text.into();
    }

    /// Requests sent and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.requests.outstanding()
    }

    /// Ask for the text and hand it to `on_contents` when it arrives.
    pub fn fetch_async<F>(&self, on_contents: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        let last_known = self.last_known.clone();
        self.requests.request_with(Value::Null, move |reply| match parse_reply(reply) {
            Ok(text) => {
                *last_known.lock() = text.clone();
                on_contents(text);
            }
            Err(e) => log::error!("malformed contents reply: {}", e),
        });
    }

    /// Blocking fetch, bounded by the permit and the timeout.
    pub fn fetch_sync(&self) -> Result<String> {
        let Some(_permit) = self.permit.try_lock() else {
            log::info!(
                "sync fetch already in flight on '{}'; serving last known content",
                self.requests.request_topic()
            );
            return Err(Error::content_unavailable(
                "another synchronous fetch is in flight",
            ));
        };

        let reply = self.requests.request(Value::Null).wait_timeout(self.timeout);
        let text = match reply {
            Ok(value) => parse_reply(value)?,
            Err(e) => {
                log::warn!("sync fetch on '{}' failed: {}", self.requests.request_topic(), e);
                return Err(e);
            }
        };
        self.set_last_known(text.clone());
        Ok(text)
    }

    /// Drop outstanding requests and stop listening for replies.
    pub fn close(&self) {
        self.requests.close();
    }
}
