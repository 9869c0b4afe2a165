use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Session, StorageScope};

const CHANNEL_CAPACITY: usize = 64;

/// A session change published by one context.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    SignedIn(Session),
    SignedOut { at: DateTime<Utc> },
}

impl SessionChange {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionChange::SignedIn(session) => session.acquired_at,
            SessionChange::SignedOut { at } => *at,
        }
    }
}

#[derive(Debug, Clone)]
struct ChangeMessage {
    origin: u64,
    scope: StorageScope,
    change: SessionChange,
}

/// In-process bus shared by every context of an application.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    sender: broadcast::Sender<ChangeMessage>,
}

impl Default for SessionChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Coordinator for one context bound to `scope`.
    pub fn coordinator(&self, scope: StorageScope) -> CrossContextCoordinator {
        CrossContextCoordinator {
            id: rand::rngs::OsRng.next_u64(),
            scope,
            sender: self.sender.clone(),
        }
    }
}

/// What a context should do with a change received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Adopt(Session),
    Clear,
    Ignore,
}

/// Publishes this context's session changes and receives those of its peers.
#[derive(Debug, Clone)]
pub struct CrossContextCoordinator {
    id: u64,
    scope: StorageScope,
    sender: broadcast::Sender<ChangeMessage>,
}

impl CrossContextCoordinator {
    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    /// Never blocks; a change with no listening peers is dropped.
    pub fn publish(&self, change: SessionChange) {
        let message = ChangeMessage {
            origin: self.id,
            scope: self.scope.clone(),
            change,
        };
        match self.sender.send(message) {
            Ok(receivers) => debug!(receivers, "published session change"),
            Err(_) => debug!("no peers listening for session changes"),
        }
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            id: self.id,
            scope: self.scope.clone(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Last writer wins by timestamp; strictly older changes are ignored.
    pub fn reconcile(current: Option<&Session>, change: &SessionChange) -> Reconciliation {
        match (current, change) {
            (None, SessionChange::SignedIn(session)) => Reconciliation::Adopt(session.clone()),
            (None, SessionChange::SignedOut { .. }) => Reconciliation::Ignore,
            (Some(current), change) if change.timestamp() < current.acquired_at => {
                Reconciliation::Ignore
            }
            (Some(current), SessionChange::SignedIn(session)) => {
                if session.access_token == current.access_token {
                    Reconciliation::Ignore
                } else {
                    Reconciliation::Adopt(session.clone())
                }
            }
            (Some(_), SessionChange::SignedOut { .. }) => Reconciliation::Clear,
        }
    }
}

/// A message from a peer, or notice that messages were missed.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Change(SessionChange),
    Lagged(u64),
}

/// Receiving half bound to one context; filters its own and foreign-scope messages.
#[derive(Debug)]
pub struct ChangeReceiver {
    id: u64,
    scope: StorageScope,
    receiver: broadcast::Receiver<ChangeMessage>,
}

impl ChangeReceiver {
    /// `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Incoming> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.origin == self.id => continue,
                Ok(message) if message.scope != self.scope => continue,
                Ok(message) => return Some(Incoming::Change(message.change)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "session change receiver lagged");
                    return Some(Incoming::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
