use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::auth::AuthKey;
use crate::error::ChatError;
use crate::messages::Signal;
use crate::model::{now_millis, UserId};
use crate::presence::{ConnectionHandle, ConnectionId, InMemoryPresence, PresenceRegistry};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a live delivery attempt. A miss is normal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Missed,
}

/// Live-channel state shared by every connection task.
pub struct ServerState {
    presence: Arc<dyn PresenceRegistry>,
    /// Every joined connection, including sessions evicted from presence.
    /// Presence broadcasts go to all of them.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Held across a presence change and its broadcast so snapshots go out
    /// in the order the changes happened.
    presence_changes: Mutex<()>,
    auth: Option<AuthKey>,
    require_join_token: bool,
    join_timeout: Duration,
}

impl ServerState {
    pub fn new() -> Self {
        Self::with_presence(Arc::new(InMemoryPresence::new()))
    }

    pub fn with_presence(presence: Arc<dyn PresenceRegistry>) -> Self {
        Self {
            presence,
            connections: DashMap::new(),
            presence_changes: Mutex::new(()),
            auth: None,
            require_join_token: false,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Verify `join` tokens with `key`.
    pub fn with_auth(mut self, key: AuthKey) -> Self {
        self.auth = Some(key);
        self
    }

    /// Reject `join` signals that carry no token.
    pub fn require_join_token(mut self, required: bool) -> Self {
        self.require_join_token = required;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// Check a `join` request and return the identity the connection is bound to.
    pub fn authorize_join(&self, user_id: &str, token: Option<&str>) -> Result<UserId, ChatError> {
        let user = UserId::parse(user_id)?;
        match (token, &self.auth) {
            (Some(token), Some(key)) => {
                let verified = key.verify(token)?;
                if verified != user {
                    return Err(ChatError::Authorization(
                        "Token does not belong to this user".to_string(),
                    ));
                }
            }
            (None, _) if self.require_join_token => {
                return Err(ChatError::Authorization("Missing join token".to_string()));
            }
            (Some(_), None) => {
                debug!(user = %user, "Join token ignored, no auth key configured");
            }
            (None, _) => {}
        }
        Ok(user)
    }

    pub fn presence(&self) -> &dyn PresenceRegistry {
        self.presence.as_ref()
    }

    /// Attach a joined connection and make it the user's live session.
    pub fn join(&self, user: UserId, handle: ConnectionHandle) {
        let _guard = self.lock_presence();
        self.connections.insert(handle.id(), handle.clone());
        let connection = handle.id();
        if let Some(evicted) = self.presence.register(user.clone(), handle) {
            info!(
                user = %user,
                old = %evicted.id(),
                new = %connection,
                "New session replaced previous connection"
            );
        }
        self.send_online_snapshot();
    }

    /// Detach a closed connection. Only clears presence if it was still current.
    pub fn leave(&self, connection: ConnectionId) {
        let _guard = self.lock_presence();
        self.connections.remove(&connection);
        match self.presence.unregister(connection) {
            Some(user) => info!(user = %user, connection = %connection, "User went offline"),
            None => debug!(connection = %connection, "Closed connection was not the active session"),
        }
        self.send_online_snapshot();
    }

    /// Push `content` to the receiver's current connection if there is one.
    /// Never persists and never retries.
    pub fn deliver_live(&self, sender: &UserId, receiver: &UserId, content: &str) -> Delivery {
        let Some(handle) = self.presence.lookup(receiver) else {
            debug!(sender = %sender, receiver = %receiver, "Receiver offline, live copy dropped");
            return Delivery::Missed;
        };

        let receive = Signal::Receive {
            sender_id: sender.to_string(),
            content: content.to_string(),
            created_at: now_millis(),
        };
        let frame = match receive.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize receive signal: {}", e);
                return Delivery::Missed;
            }
        };

        if handle.send(&frame) {
            Delivery::Delivered
        } else {
            warn!(
                receiver = %receiver,
                connection = %handle.id(),
                "Live delivery to stale connection failed"
            );
            Delivery::Missed
        }
    }

    /// Send the current online set to every joined connection.
    pub fn broadcast_online(&self) {
        let _guard = self.lock_presence();
        self.send_online_snapshot();
    }

    fn lock_presence(&self) -> MutexGuard<'_, ()> {
        self.presence_changes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caller must hold the presence lock.
    fn send_online_snapshot(&self) {
        let users = self
            .presence
            .list_online()
            .into_iter()
            .map(String::from)
            .collect();
        match (Signal::OnlineUsers { users }).to_frame() {
            Ok(frame) => {
                for entry in self.connections.iter() {
                    entry.value().send(&frame);
                }
            }
            Err(e) => error!("Failed to serialize online users: {}", e),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
