// Core data model shared by the store, the realtime pump and the send queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type MessageId = String;
pub type ConversationId = String;
pub type UserId = String;
pub type CorrelationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending, // Optimistically inserted, waiting for the persistence port
    Sent,    // Committed by the persistence port
    Failed,  // Gave up; kept so the UI can offer a retry
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Client-generated id linking an optimistic entry to its outcome.
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    /// Build the optimistic local copy of an outgoing message.
    ///
    /// The temporary id is the correlation id itself so it can never clash
    /// with a server-assigned id.
    pub fn pending(draft: &MessageDraft, created_at: DateTime<Utc>) -> Self {
        Message {
            id: format!("local:{}", draft.correlation_id),
            conversation_id: draft.conversation_id.clone(),
            sender_id: draft.sender_id.clone(),
            body: draft.body.clone(),
            attachment: draft.attachment.clone(),
            created_at,
            status: MessageStatus::Pending,
            correlation_id: Some(draft.correlation_id.clone()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

/// What the send queue hands to the persistence port.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub correlation_id: CorrelationId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Resync position: the last committed message a store knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Group,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participant_ids: BTreeSet<UserId>,
}

impl Conversation {
    pub fn group(id: impl Into<String>, members: impl IntoIterator<Item = UserId>) -> Self {
        Conversation {
            id: id.into(),
            kind: ConversationKind::Group,
            participant_ids: members.into_iter().collect(),
        }
    }

    /// Direct conversations get the same id regardless of who opens them.
    pub fn direct(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Conversation {
            id: format!("dm:{}:{}", first, second),
            kind: ConversationKind::Direct,
            participant_ids: [a.to_string(), b.to_string()].into_iter().collect(),
        }
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.participant_ids.contains(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Typing,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub state: PresenceState,
    pub expires_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(body: &str) -> MessageDraft {
        MessageDraft {
            correlation_id: "c-1".to_string(),
            conversation_id: "g1".to_string(),
            sender_id: "alice".to_string(),
            body: body.to_string(),
            attachment: None,
        }
    }

    #[test]
    fn test_pending_message_from_draft() {
        let now = Utc::now();
        let msg = Message::pending(&draft("hello"), now);

        assert_eq!(msg.id, "local:c-1");
        assert_eq!(msg.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.created_at, now);
        assert!(msg.is_pending());
    }

    #[test]
    fn test_direct_conversation_id_is_symmetric() {
        let ab = Conversation::direct("alice", "bob");
        let ba = Conversation::direct("bob", "alice");

        assert_eq!(ab.id, ba.id);
        assert_eq!(ab.kind, ConversationKind::Direct);
        assert!(ab.includes("alice") && ab.includes("bob"));
        assert_eq!(ab.participant_ids.len(), 2);
    }

    #[test]
    fn test_group_participants_are_unique() {
        let group = Conversation::group(
            "g1",
            vec!["mom".to_string(), "dad".to_string(), "mom".to_string()],
        );
        assert_eq!(group.participant_ids.len(), 2);
    }

    #[test]
    fn test_presence_entry_liveness() {
        let now = Utc::now();
        let entry = PresenceEntry {
            user_id: "kid".to_string(),
            conversation_id: "g1".to_string(),
            state: PresenceState::Typing,
            expires_at: now + Duration::seconds(3),
        };
        assert!(entry.is_live(now));
        assert!(!entry.is_live(now + Duration::seconds(3)));
    }
}
