use crate::model::ChatEntry;

/// The record list of the conversation that is currently open.
#[derive(Debug, Default, Clone)]
pub struct ConversationView {
    peer: Option<String>,
    records: Vec<ChatEntry>,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn records(&self) -> &[ChatEntry] {
        &self.records
    }

    /// Switch to `peer` with an empty record list.
    pub fn begin(&mut self, peer: &str) {
        self.peer = Some(peer.to_string());
        self.records.clear();
    }

    /// Replace everything with fetched history, unless another
    /// conversation was opened while it was loading.
    pub fn replace_history(&mut self, peer: &str, history: Vec<ChatEntry>) -> bool {
        if self.peer() != Some(peer) {
            return false;
        }
        self.records = history;
        true
    }

    /// Optimistic echo of our own send.
    pub fn push_local(&mut self, entry: ChatEntry) {
        self.records.push(entry);
    }

    /// Apply a live delivery. Returns whether it was appended.
    ///
    /// Only the open peer (or ourselves) may add to this view, and an
    /// entry with the same content and timestamp is never added twice.
    pub fn accept_live(&mut self, me: &str, entry: ChatEntry) -> bool {
        let Some(peer) = self.peer.as_deref() else {
            return false;
        };
        if entry.sender_id != peer && entry.sender_id != me {
            return false;
        }
        let duplicate = self
            .records
            .iter()
            .any(|r| r.content == entry.content && r.created_at == entry.created_at);
        if duplicate {
            return false;
        }
        self.records.push(entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn entry(sender: &str, content: &str, ms: i64) -> ChatEntry {
        ChatEntry {
            sender_id: sender.to_string(),
            content: content.to_string(),
            created_at: at(ms),
        }
    }

    fn opened(peer: &str) -> ConversationView {
        let mut view = ConversationView::new();
        view.begin(peer);
        view
    }

    #[test]
    fn test_nothing_accepted_without_open_conversation() {
        let mut view = ConversationView::new();
        assert!(!view.accept_live("me", entry("bob", "hi", 1)));
        assert!(view.records().is_empty());
    }

    #[test]
    fn test_accepts_only_open_peer_or_self() {
        let mut view = opened("bob");
        assert!(view.accept_live("me", entry("bob", "from bob", 1)));
        assert!(view.accept_live("me", entry("me", "from me", 2)));
        assert!(!view.accept_live("me", entry("carol", "from carol", 3)));

        let senders: Vec<_> = view.records().iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, vec!["bob", "me"]);
    }

    #[test]
    fn test_duplicate_content_and_timestamp_is_dropped() {
        let mut view = opened("bob");
        view.push_local(entry("me", "hello", 10));

        assert!(!view.accept_live("me", entry("me", "hello", 10)));
        assert!(view.accept_live("me", entry("bob", "hello", 11)));
        assert!(view.accept_live("me", entry("bob", "different", 10)));
        assert_eq!(view.records().len(), 3);
    }

    #[test]
    fn test_history_replaces_view() {
        let mut view = opened("bob");
        view.push_local(entry("me", "draft", 5));

        let history = vec![entry("bob", "a", 1), entry("me", "b", 2)];
        assert!(view.replace_history("bob", history.clone()));
        assert_eq!(view.records(), history.as_slice());
    }

    #[test]
    fn test_stale_history_is_discarded() {
        let mut view = opened("bob");
        view.begin("carol");

        assert!(!view.replace_history("bob", vec![entry("bob", "late", 1)]));
        assert_eq!(view.peer(), Some("carol"));
        assert!(view.records().is_empty());
    }
}
