//! Chat ring buffer
//!
//! The hub keeps the last K chat messages (default 500) for replay to late
//! joiners in `login_success`. Entries are immutable once logged; overflow
//! drops head-first. Server clock is authoritative for timestamps.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::registry::participant::ClientId;

/// One logged chat message, as carried on the wire in `chat_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender_id: ClientId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: String,
}

/// Bounded chat history.
#[derive(Debug)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    capacity: usize,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full. Returns true when an
    /// old entry was dropped.
    pub fn push(&mut self, entry: ChatEntry) -> bool {
        let mut dropped = false;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            dropped = true;
        }
        self.entries.push_back(entry);
        dropped
    }

    /// Full history, oldest first, for `login_success` replay.
    pub fn history(&self) -> Vec<ChatEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> ChatEntry {
        ChatEntry {
            sender_id: n,
            sender_name: format!("user{}", n),
            text: format!("message {}", n),
            timestamp: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_push_and_history_order() {
        let mut log = ChatLog::new(10);

        for n in 0..3 {
            assert!(!log.push(entry(n)));
        }

        let history = log.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].sender_id, 0);
        assert_eq!(history[2].sender_id, 2);
    }

    #[test]
    fn test_overflow_drops_head_first() {
        let mut log = ChatLog::new(3);

        for n in 0..3 {
            log.push(entry(n));
        }
        assert!(log.push(entry(3)));

        let history = log.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].sender_id, 1); // entry 0 dropped
        assert_eq!(history[2].sender_id, 3);
    }

    #[test]
    fn test_capacity_one() {
        let mut log = ChatLog::new(1);

        log.push(entry(0));
        log.push(entry(1));

        assert_eq!(log.len(), 1);
        assert_eq!(log.history()[0].sender_id, 1);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(entry(5)).unwrap();

        assert_eq!(json["sender_id"], 5);
        assert_eq!(json["sender_name"], "user5");
        assert_eq!(json["text"], "message 5");
        assert!(json["timestamp"].is_string());
    }
}
