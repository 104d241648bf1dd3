use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable chat event as seen by recipients.
///
/// System messages are produced by the hub itself (join and leave notices);
/// their `from` names the identity the notice is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
    pub time: DateTime<Utc>,
    pub system: bool,
}

impl ChatMessage {
    pub fn chat(from: &str, text: &str) -> Self {
        Self {
            from: from.to_string(),
            text: text.to_string(),
            time: Utc::now(),
            system: false,
        }
    }

    pub fn joined(identity: &str) -> Self {
        Self::notice(identity, format!("User [{identity}] joined"))
    }

    pub fn left(identity: &str) -> Self {
        Self::notice(identity, format!("User [{identity}] left"))
    }

    fn notice(identity: &str, text: String) -> Self {
        Self {
            from: identity.to_string(),
            text,
            time: Utc::now(),
            system: true,
        }
    }

    /// Chat messages are never echoed back to their author; system notices go
    /// to everyone, the subject included.
    pub fn is_echo_for(&self, identity: &str) -> bool {
        !self.system && self.from == identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_chat_messages_count_as_echoes() {
        let chat = ChatMessage::chat("alice", "hello");
        assert!(chat.is_echo_for("alice"));
        assert!(!chat.is_echo_for("bob"));

        let notice = ChatMessage::joined("alice");
        assert!(!notice.is_echo_for("alice"));
        assert_eq!(notice.text, "User [alice] joined");
    }
}
