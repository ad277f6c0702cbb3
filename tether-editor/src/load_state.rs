//! Readiness gate for operations that need the editor content to exist.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub type PendingAction = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    /// The readiness signal arrived and queued actions are being replayed.
    Flushing,
    Loaded,
}

struct Inner {
    state: LoadState,
    pending: VecDeque<PendingAction>,
}

/// Queues actions until the editor signals readiness, then replays them in
/// the order they were queued, each exactly once.
///
/// Actions queued while a replay is running join the same replay instead of
/// running immediately, so they can never overtake older ones.
pub struct LoadGate {
    inner: Mutex<Inner>,
}

impl Default for LoadGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LoadState::NotLoaded,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> LoadState {
        self.inner.lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LoadState::Loaded
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Run `action` now if loaded, otherwise queue it.
    pub fn run_or_defer<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state != LoadState::Loaded {
                inner.pending.push_back(Box::new(action));
                return;
            }
        }
        action();
    }

    /// Transition to `Loaded`, replaying queued actions. Later calls do nothing.
    pub fn mark_loaded(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != LoadState::NotLoaded {
                return;
            }
            inner.state = LoadState::Flushing;
        }

        loop {
            let next = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_front() {
                    Some(action) => action,
                    None => {
                        inner.state = LoadState::Loaded;
                        break;
                    }
                }
            };
            next();
        }
        log::debug!("editor content loaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn replays_in_order_exactly_once() {
        let gate = LoadGate::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            gate.run_or_defer(move || log.lock().push(i));
        }
        assert!(log.lock().is_empty());
        assert_eq!(gate.pending_len(), 5);

        gate.mark_loaded();
        gate.mark_loaded();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(gate.state(), LoadState::Loaded);
    }

    #[test]
    fn runs_immediately_once_loaded() {
        let gate = LoadGate::new();
        gate.mark_loaded();
        let hit = Arc::new(Mutex::new(false));
        let h = hit.clone();
        gate.run_or_defer(move || *h.lock() = true);
        assert!(*hit.lock());
        assert_eq!(gate.pending_len(), 0);
    }

    #[test]
    fn actions_queued_during_replay_keep_their_place() {
        let gate = Arc::new(LoadGate::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let (g, l) = (gate.clone(), log.clone());
        gate.run_or_defer(move || {
            l.lock().push("first");
            let l2 = l.clone();
            g.run_or_defer(move || l2.lock().push("queued during replay"));
        });
        let l = log.clone();
        gate.run_or_defer(move || l.lock().push("second"));

        gate.mark_loaded();
        assert_eq!(
            *log.lock(),
            vec!["first", "second", "queued during replay"]
        );
    }

    #[test]
    fn concurrent_enqueue_is_never_lost_or_duplicated() {
        let gate = Arc::new(LoadGate::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let gate = gate.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let log = log.clone();
                        gate.run_or_defer(move || log.lock().push((t, i)));
                    }
                })
            })
            .collect();
        gate.mark_loaded();
        for p in producers {
            p.join().unwrap();
        }

        let log = log.lock();
        assert_eq!(log.len(), 1000);
        for t in 0..4 {
            let seen: Vec<_> = log.iter().filter(|(p, _)| *p == t).map(|(_, i)| *i).collect();
            assert_eq!(seen, (0..250).collect::<Vec<_>>());
        }
    }
}
