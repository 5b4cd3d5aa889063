//! Append-only chat history backed by SQLite.
//!
//! Every message is filed under the [`ConversationKey`] of its two
//! participants. Reads return a conversation ordered by `created_at`,
//! with the autoincrement `seq` column breaking timestamp ties in insertion
//! order.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tracing::{debug, info};

use crate::error::ChatError;
use crate::model::{now_millis, ConversationKey, Message, UserId};

pub const MAX_MESSAGE_LENGTH: usize = 10000;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl MessageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened message store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChatError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Replace the timestamp source used by [`MessageStore::append`].
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn init(conn: Connection) -> Result<Self, ChatError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_key TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_key, created_at, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_sender_receiver
                ON messages(sender_id, receiver_id);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(now_millis),
        })
    }

    /// Run a blocking closure against the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Connection) -> Result<T, ChatError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| ChatError::Storage(format!("lock poisoned: {}", e)))?;
            f(&conn)
        })
        .await?
    }

    pub async fn append(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> Result<Message, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("Message content cannot be empty".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(ChatError::Validation(format!(
                "Message too long (max {} characters)",
                MAX_MESSAGE_LENGTH
            )));
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_key: ConversationKey::between(sender, receiver),
            sender: sender.clone(),
            receiver: receiver.clone(),
            content: content.to_string(),
            created_at: (self.clock)(),
            read: false,
        };

        let stored = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_key, sender_id, receiver_id, content, created_at, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                (
                    &stored.id,
                    stored.conversation_key.as_str(),
                    stored.sender.as_str(),
                    stored.receiver.as_str(),
                    &stored.content,
                    stored.created_at.timestamp_millis(),
                ),
            )?;
            Ok(())
        })
        .await?;

        debug!(id = %message.id, conversation = %message.conversation_key, "Stored message");
        Ok(message)
    }

    pub async fn history(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, ChatError> {
        let key = ConversationKey::between(a, b);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at, is_read
                 FROM messages
                 WHERE conversation_key = ?1
                 ORDER BY created_at ASC, seq ASC",
            )?;
            let messages = stmt
                .query_map([key.as_str()], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// Mark everything `sender` sent to `receiver` as read. Returns the number of rows that changed.
    pub async fn mark_read(&self, receiver: &UserId, sender: &UserId) -> Result<usize, ChatError> {
        let receiver = receiver.clone();
        let sender = sender.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET is_read = 1 WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                [sender.as_str(), receiver.as_str()],
            )?;
            Ok(updated)
        })
        .await
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender = user_column(row, 1)?;
    let receiver = user_column(row, 2)?;
    let millis: i64 = row.get(4)?;
    let created_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })?;

    Ok(Message {
        id: row.get(0)?,
        conversation_key: ConversationKey::between(&sender, &receiver),
        sender,
        receiver,
        content: row.get(3)?,
        created_at,
        read: row.get::<_, i32>(5)? == 1,
    })
}

fn user_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<UserId> {
    let raw: String = row.get(idx)?;
    UserId::parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
