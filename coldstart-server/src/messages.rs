use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live channel signals, one JSON text frame each.
///
/// User ids are kept as raw strings on the wire so that a malformed id
/// produces a logged drop instead of an unparseable frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "onlineUsers")]
    OnlineUsers { users: Vec<String> },
    #[serde(rename = "send", rename_all = "camelCase")]
    Send {
        sender_id: String,
        receiver_id: String,
        content: String,
    },
    #[serde(rename = "receive", rename_all = "camelCase")]
    Receive {
        sender_id: String,
        content: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl Signal {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
