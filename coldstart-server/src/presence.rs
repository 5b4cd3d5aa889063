use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::UserId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a live connection. Two handles are equal only if they
/// refer to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for this connection. Returns false if the connection is gone.
    pub fn send(&self, frame: &str) -> bool {
        self.tx.send(frame.to_string()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Who is reachable for live delivery, and through which connection.
///
/// Holds at most one handle per user; the latest registration wins.
pub trait PresenceRegistry: Send + Sync {
    /// Bind `user` to `handle`, returning the handle it replaced, if any.
    fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle>;

    /// Remove the entry owned by `connection`, but only while it is still
    /// the registered handle for its user. Returns the user that went offline.
    fn unregister(&self, connection: ConnectionId) -> Option<UserId>;

    fn lookup(&self, user: &UserId) -> Option<ConnectionHandle>;

    fn list_online(&self) -> BTreeSet<UserId>;
}

/// Single-process registry. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryPresence {
    entries: DashMap<UserId, ConnectionHandle>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceRegistry for InMemoryPresence {
    fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        debug!(user = %user, connection = %handle.id(), "Registering presence");
        self.entries.insert(user, handle)
    }

    fn unregister(&self, connection: ConnectionId) -> Option<UserId> {
        let owner = self
            .entries
            .iter()
            .find(|entry| entry.value().id() == connection)
            .map(|entry| entry.key().clone())?;

        // Re-check under the shard lock: a newer session may have replaced
        // this handle between the scan and the removal.
        self.entries
            .remove_if(&owner, |_, handle| handle.id() == connection)
            .map(|(user, _)| user)
    }

    fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.entries.get(user).map(|entry| entry.value().clone())
    }

    fn list_online(&self) -> BTreeSet<UserId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}
