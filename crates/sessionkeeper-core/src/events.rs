//! Publish point for session lifecycle events.
//!
//! Parts of the client that must react to a session ending (redirect to the
//! login view, purge in-memory user state) subscribe here instead of reaching
//! into the session manager. Delivery is synchronous, in subscription order,
//! on the publishing thread. Past events are not replayed to late subscribers.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::debug;

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum ExpiryReason {
    RefreshRejected,
    RefreshExhausted,
    CredentialExpired,
    InvalidCredential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    SessionStarted { generation: u64 },
    SessionRefreshed { generation: u64 },
    ExpiryWarning { generation: u64, seconds_remaining: i64 },
    SessionExpired { generation: u64, reason: ExpiryReason },
    SessionEnded { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    SessionStarted,
    SessionRefreshed,
    ExpiryWarning,
    SessionExpired,
    SessionEnded,
}

impl SessionEventKind {
    pub fn name(self) -> &'static str {
        match self {
            SessionEventKind::SessionStarted => "session-started",
            SessionEventKind::SessionRefreshed => "session-refreshed",
            SessionEventKind::ExpiryWarning => "expiry-warning",
            SessionEventKind::SessionExpired => "session-expired",
            SessionEventKind::SessionEnded => "session-ended",
        }
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::SessionStarted { .. } => SessionEventKind::SessionStarted,
            SessionEvent::SessionRefreshed { .. } => SessionEventKind::SessionRefreshed,
            SessionEvent::ExpiryWarning { .. } => SessionEventKind::ExpiryWarning,
            SessionEvent::SessionExpired { .. } => SessionEventKind::SessionExpired,
            SessionEvent::SessionEnded { .. } => SessionEventKind::SessionEnded,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    kind: SessionEventKind,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Cloneable handle; all clones share one subscriber list.
#[derive(Clone, Default)]
pub struct SessionEventBus {
    registry: Arc<Mutex<Registry>>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: SessionEventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every current subscriber of its kind.
    pub fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<EventHandler> = self
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();
        debug!(event = %kind, subscribers = handlers.len(), "Publishing session event");
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, kind: SessionEventKind) -> usize {
        self.lock().subscribers.iter().filter(|s| s.kind == kind).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returned by `subscribe`; dropping it keeps the subscription alive.
#[must_use = "keep the Subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.subscribers.retain(|s| s.id != self.id);
        }
    }
}
