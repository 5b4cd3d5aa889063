use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_key: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// One line of the conversation view.
///
/// History, optimistic echoes and live deliveries all normalize to this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for ChatEntry {
    fn from(message: StoredMessage) -> Self {
        Self {
            sender_id: message.sender,
            content: message.content,
            created_at: message.created_at,
        }
    }
}

/// Client clock at millisecond precision, matching what the server stores.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
