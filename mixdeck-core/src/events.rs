//! Playback token events
//!
//! Each token owns an `EventEmitter`. Dispatch is synchronous and in order of
//! registration; it runs over a snapshot of the listener list, so listeners
//! may add or remove listeners (or call back into the token) while an event
//! is being delivered. One-shot listeners are removed before they run.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event categories a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Ended,
    Pause,
    Resume,
    Stop,
    Seek,
}

/// Event emitted by a playback token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenEvent {
    /// Source reached its natural end (terminal)
    Ended,
    /// Playback paused at `position` seconds
    Pause { position: f64 },
    /// Playback resumed from `position` seconds
    Resume { position: f64 },
    /// Token stopped (terminal)
    Stop,
    /// Playback position moved to `position` seconds
    Seek { position: f64 },
}

impl TokenEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TokenEvent::Ended => EventKind::Ended,
            TokenEvent::Pause { .. } => EventKind::Pause,
            TokenEvent::Resume { .. } => EventKind::Resume,
            TokenEvent::Stop => EventKind::Stop,
            TokenEvent::Seek { .. } => EventKind::Seek,
        }
    }
}

/// Handle returned by `on`/`once`, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub type Listener = Arc<dyn Fn(&TokenEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    listener: Listener,
}

/// Observer registry for one token
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent listener
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(listener))
    }

    /// Register a listener that runs at most once
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(listener))
    }

    /// Remove a listener; returns false if it was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Deliver an event to every listener registered for its kind
    pub fn emit(&self, event: &TokenEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = {
            let mut registrations = self.registrations.lock();
            let snapshot = registrations
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| Arc::clone(&r.listener))
                .collect();
            registrations.retain(|r| !(r.once && r.kind == kind));
            snapshot
        };

        for listener in snapshot {
            listener(event);
        }
    }

    fn register(&self, kind: EventKind, once: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().push(Registration {
            id,
            kind,
            once,
            listener,
        });
        id
    }
}
