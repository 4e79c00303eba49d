use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use srmc_types::{CloseCode, ConnectionId, ControlFrame, IdentityId, Message};

/// Items queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Application message, encrypted by the writer with the recipient's key.
    Message(Arc<Message>),
    /// Plaintext control frame.
    Control(ControlFrame),
}

/// Snapshot of a live connection's attributes.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: IdentityId,
    pub remote: Option<SocketAddr>,
    pub privileged: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// What the processing path knows about the connection a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub identity: IdentityId,
    pub privileged: bool,
}

/// Handed to the connection loop when it registers.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Cancelled when the connection is terminated or unregistered.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub identity: IdentityId,
    /// The identity has no connections left and was evicted.
    pub last_for_identity: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
}

struct ConnectionEntry {
    id: ConnectionId,
    identity: IdentityId,
    remote: Option<SocketAddr>,
    privileged: bool,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    close: Mutex<Option<(CloseCode, String)>>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            identity: self.identity.clone(),
            remote: self.remote,
            privileged: self.privileged,
            created_at: self.created_at,
            last_activity: *self.last_activity.lock().expect("activity lock poisoned"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Arc<ConnectionEntry>>,
    identities: HashMap<IdentityId, HashSet<ConnectionId>>,
}

/// The single source of truth for which connections are live.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    queue_capacity: usize,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Register a new connection for `identity` under a fresh id.
    pub async fn register(
        &self,
        identity: IdentityId,
        remote: Option<SocketAddr>,
        privileged: bool,
    ) -> Registration {
        loop {
            if let Some(reg) = self
                .register_with_id(Uuid::new_v4(), identity.clone(), remote, privileged)
                .await
            {
                return reg;
            }
        }
    }

    /// Register under a caller-chosen id. Returns `None` (and changes
    /// nothing) if the id is already registered.
    pub async fn register_with_id(
        &self,
        id: ConnectionId,
        identity: IdentityId,
        remote: Option<SocketAddr>,
        privileged: bool,
    ) -> Option<Registration> {
        let mut state = self.inner.state.write().await;
        if state.connections.contains_key(&id) {
            return None;
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let cancel = CancellationToken::new();
        let now = Utc::now();
        let entry = ConnectionEntry {
            id,
            identity: identity.clone(),
            remote,
            privileged,
            created_at: now,
            last_activity: Mutex::new(now),
            close: Mutex::new(None),
            tx,
            cancel: cancel.clone(),
        };

        state.connections.insert(id, Arc::new(entry));
        state.identities.entry(identity).or_default().insert(id);

        Some(Registration {
            id,
            outbound: rx,
            cancel,
        })
    }

    /// Remove a connection. Cancels any outstanding I/O on it and evicts the
    /// identity record once its last connection is gone.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Unregistered> {
        let mut state = self.inner.state.write().await;
        let entry = state.connections.remove(&id)?;
        entry.cancel.cancel();

        let mut last_for_identity = false;
        if let Some(set) = state.identities.get_mut(&entry.identity) {
            set.remove(&id);
            if set.is_empty() {
                state.identities.remove(&entry.identity);
                last_for_identity = true;
            }
        }

        Some(Unregistered {
            identity: entry.identity.clone(),
            last_for_identity,
        })
    }

    /// Deliver `message` to every live connection except `exclude`.
    ///
    /// Never waits on a recipient: a full or closing queue skips that
    /// recipient only.
    pub async fn broadcast(&self, message: Arc<Message>, exclude: Option<ConnectionId>) -> BroadcastReport {
        let state = self.inner.state.read().await;
        let mut report = BroadcastReport::default();

        for (id, entry) in state.connections.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if entry.cancel.is_cancelled() {
                debug!("Skipping delivery to closing connection {}", id);
                report.skipped += 1;
                continue;
            }
            match entry.tx.try_send(Outbound::Message(message.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("{} ({}) send queue full, dropping broadcast", entry.identity, id);
                    report.skipped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("{} ({}) queue closed, dropping broadcast", entry.identity, id);
                    report.skipped += 1;
                }
            }
        }

        report
    }

    /// Queue an item for one connection. Returns false if it is gone or its
    /// queue is full.
    pub async fn send_to(&self, id: ConnectionId, item: Outbound) -> bool {
        let state = self.inner.state.read().await;
        let Some(entry) = state.connections.get(&id) else {
            return false;
        };
        match entry.tx.try_send(item) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping outbound item for {}: {}", id, e);
                false
            }
        }
    }

    /// Queue an item for every connection of `identity`. Returns how many
    /// queues accepted it.
    pub async fn send_to_identity(&self, identity: &IdentityId, item: Outbound) -> usize {
        let state = self.inner.state.read().await;
        let Some(ids) = state.identities.get(identity) else {
            return 0;
        };
        let mut delivered = 0;
        for entry in ids.iter().filter_map(|id| state.connections.get(id)) {
            match entry.tx.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Dropping outbound item for {}: {}", entry.id, e),
            }
        }
        delivered
    }

    /// Close a connection with `code`. The first recorded reason wins.
    pub async fn terminate(&self, id: ConnectionId, code: CloseCode, detail: impl Into<String>) -> bool {
        let state = self.inner.state.read().await;
        let Some(entry) = state.connections.get(&id) else {
            return false;
        };
        {
            let mut close = entry.close.lock().expect("close lock poisoned");
            if close.is_none() {
                *close = Some((code, detail.into()));
            }
        }
        entry.cancel.cancel();
        true
    }

    /// Close reason recorded by [`terminate`](Self::terminate), if any.
    pub async fn close_reason(&self, id: ConnectionId) -> Option<(CloseCode, String)> {
        let state = self.inner.state.read().await;
        let entry = state.connections.get(&id)?;
        entry.close.lock().expect("close lock poisoned").clone()
    }

    /// Record inbound activity on a connection.
    pub async fn touch(&self, id: ConnectionId) {
        let state = self.inner.state.read().await;
        if let Some(entry) = state.connections.get(&id) {
            *entry.last_activity.lock().expect("activity lock poisoned") = Utc::now();
        }
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let state = self.inner.state.read().await;
        state.connections.get(&id).map(|e| e.info())
    }

    pub async fn connections_of(&self, identity: &IdentityId) -> Vec<ConnectionInfo> {
        let state = self.inner.state.read().await;
        state
            .identities
            .get(identity)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(|e| e.info())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identities with at least one live connection.
    pub async fn identities(&self) -> Vec<IdentityId> {
        let state = self.inner.state.read().await;
        let mut ids: Vec<IdentityId> = state.identities.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.state.read().await.connections.len()
    }

    /// Terminate every connection, e.g. on shutdown.
    pub async fn terminate_all(&self, code: CloseCode) {
        let ids: Vec<ConnectionId> = self.inner.state.read().await.connections.keys().copied().collect();
        for id in ids {
            self.terminate(id, code, code.reason()).await;
        }
    }
}
