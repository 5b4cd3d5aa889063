//! One user's view of the chat: live channel, persistence and the open
//! conversation, kept in step.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::{now_millis, ChatEntry, StoredMessage};
use crate::rest::ChatApi;
use crate::view::ConversationView;
use crate::websocket::{LiveClient, Signal};

/// What happened to a send after the optimistic echo.
#[derive(Debug)]
pub enum SendOutcome {
    /// Persisted; the server's copy is attached.
    Saved(StoredMessage),
    /// Emitted live (if the peer was online) but the save failed.
    /// Nothing is retried.
    DeliveredNotSaved(ClientError),
}

pub struct ChatSession {
    me: String,
    live: LiveClient,
    api: ChatApi,
    view: Arc<Mutex<ConversationView>>,
    online: Arc<Mutex<BTreeSet<String>>>,
    presence_task: JoinHandle<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatSession {
    /// Join the live channel as `me` and wait until the server lists us online.
    pub async fn connect(config: ClientConfig, me: &str, token: &str) -> Result<Self, ClientError> {
        let me = me.trim().to_string();
        if me.is_empty() {
            return Err(ClientError::Validation("User id cannot be empty".to_string()));
        }

        let api = ChatApi::new(&config.api_url, token)?;
        let live = LiveClient::new(config.ws_url.clone(), config.reconnect_delay);

        // Subscribe before connecting so the first snapshot is not missed
        let mut ready = live.subscribe();
        let presence_rx = live.subscribe();
        live.connect(&me, Some(token.to_string()));

        let online = Arc::new(Mutex::new(BTreeSet::new()));
        let joined = tokio::time::timeout(config.join_timeout, async {
            loop {
                match ready.recv().await {
                    Ok(Signal::OnlineUsers { users }) if users.contains(&me) => return Ok(users),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(ClientError::NotConnected),
                }
            }
        })
        .await;

        let users = match joined {
            Ok(result) => result?,
            Err(_) => {
                warn!(user = %me, "Live channel did not confirm join in time");
                live.disconnect();
                return Err(ClientError::NotConnected);
            }
        };
        *lock(&online) = users.into_iter().collect();
        info!(user = %me, "Chat session ready");

        let presence_task = tokio::spawn(track_presence(presence_rx, online.clone()));

        Ok(Self {
            me,
            live,
            api,
            view: Arc::new(Mutex::new(ConversationView::new())),
            online,
            presence_task,
            listener: Mutex::new(None),
        })
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    /// Open the conversation with `peer`, replacing whatever was shown.
    ///
    /// The live listener is re-scoped to `peer` before history is fetched.
    /// If the fetch fails the conversation stays open with an empty view.
    pub async fn open(&self, peer: &str) -> Result<(), ClientError> {
        let peer = peer.trim().to_string();
        if peer.is_empty() {
            return Err(ClientError::Validation("Peer id cannot be empty".to_string()));
        }

        lock(&self.view).begin(&peer);
        self.rebind_listener(&peer);

        let history = self.api.history(&peer).await?;
        let entries = history.into_iter().map(ChatEntry::from).collect();
        if !lock(&self.view).replace_history(&peer, entries) {
            debug!(peer = %peer, "Conversation changed while history was loading");
            return Ok(());
        }

        match self.api.mark_read(&peer).await {
            Ok(updated) => debug!(peer = %peer, updated, "Marked conversation read"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to mark conversation read"),
        }
        Ok(())
    }

    /// Send `content` to the open peer.
    ///
    /// The view is updated before any network call. The live emit and the
    /// save are independent; a failed save is reported, not retried.
    pub async fn send(&self, content: &str) -> Result<SendOutcome, ClientError> {
        let peer = lock(&self.view)
            .peer()
            .map(str::to_string)
            .ok_or(ClientError::NoConversation)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::Validation("Message content cannot be empty".to_string()));
        }

        lock(&self.view).push_local(ChatEntry {
            sender_id: self.me.clone(),
            content: content.to_string(),
            created_at: now_millis(),
        });

        let signal = Signal::Send {
            sender_id: self.me.clone(),
            receiver_id: peer.clone(),
            content: content.to_string(),
        };
        if let Err(e) = self.live.send(&signal) {
            warn!(peer = %peer, error = %e, "Live emit failed, relying on persistence");
        }

        match self.api.persist(&peer, content).await {
            Ok(message) => Ok(SendOutcome::Saved(message)),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Message was not saved");
                Ok(SendOutcome::DeliveredNotSaved(e))
            }
        }
    }

    /// Snapshot of the open conversation.
    pub fn view(&self) -> Vec<ChatEntry> {
        lock(&self.view).records().to_vec()
    }

    pub fn peer(&self) -> Option<String> {
        lock(&self.view).peer().map(str::to_string)
    }

    pub fn online_users(&self) -> BTreeSet<String> {
        lock(&self.online).clone()
    }

    pub fn is_online(&self, user: &str) -> bool {
        lock(&self.online).contains(user)
    }

    pub async fn is_connected(&self) -> bool {
        self.live.is_connected().await
    }

    /// Stop the live client; the session is unusable for live traffic after this.
    pub fn disconnect(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.presence_task.abort();
        self.live.disconnect();
    }

    fn rebind_listener(&self, peer: &str) {
        let events = self.live.subscribe();
        let task = tokio::spawn(listen(
            events,
            self.me.clone(),
            peer.to_string(),
            self.view.clone(),
        ));
        if let Some(previous) = lock(&self.listener).replace(task) {
            previous.abort();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Feed live deliveries from `peer` (or ourselves) into the view.
async fn listen(
    mut events: broadcast::Receiver<Signal>,
    me: String,
    peer: String,
    view: Arc<Mutex<ConversationView>>,
) {
    loop {
        match events.recv().await {
            Ok(Signal::Receive {
                sender_id,
                content,
                created_at,
            }) => {
                if sender_id != peer && sender_id != me {
                    continue;
                }
                let entry = ChatEntry {
                    sender_id,
                    content,
                    created_at,
                };
                if !lock(&view).accept_live(&me, entry) {
                    debug!(peer = %peer, "Duplicate live delivery ignored");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Live listener lagged behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn track_presence(mut events: broadcast::Receiver<Signal>, online: Arc<Mutex<BTreeSet<String>>>) {
    loop {
        match events.recv().await {
            Ok(Signal::OnlineUsers { users }) => {
                *lock(&online) = users.into_iter().collect();
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
