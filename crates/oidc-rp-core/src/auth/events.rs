use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{AuthError, Session};

/// Lifecycle notifications delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Loaded(Session),
    Unloaded,
    Expiring { expires_at: DateTime<Utc> },
    Expired,
    Renewing,
    RenewError(Arc<AuthError>),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Loaded(_) => "loaded",
            SessionEvent::Unloaded => "unloaded",
            SessionEvent::Expiring { .. } => "expiring",
            SessionEvent::Expired => "expired",
            SessionEvent::Renewing => "renewing",
            SessionEvent::RenewError(_) => "renew_error",
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Synchronous fan-out of [`SessionEvent`]s in subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.lock().entries.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut guard = self.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.insert(id, Arc::new(listener));
        SubscriptionId(id)
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().entries.remove(&id.0).is_some()
    }

    /// Listeners may subscribe or unsubscribe from inside a callback; the set
    /// notified is the one registered when `emit` started.
    pub fn emit(&self, event: SessionEvent) {
        let snapshot: Vec<Listener> = self.lock().entries.values().cloned().collect();
        tracing::trace!(event = event.name(), listeners = snapshot.len(), "emitting session event");
        for listener in snapshot {
            listener(&event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
