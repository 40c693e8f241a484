//! Boundaries to the hosted backend.
//!
//! The conversation client never talks to a network directly. Durable
//! storage, the live-update transport and the signed-in identity are all
//! reached through these traits so the backend can be swapped (or replaced
//! by [`crate::memory::MemoryBackend`] in tests).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::models::{ConversationId, Cursor, Message, MessageDraft, UserId};

/// Source of truth for message history and group membership.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Messages of `conversation_id` committed after `since`, oldest first.
    /// `None` means from the beginning.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        since: Option<&Cursor>,
    ) -> Result<Vec<Message>>;

    /// Commit a message. The returned copy carries the authoritative id and
    /// timestamp plus the draft's correlation id.
    async fn persist_message(&self, draft: &MessageDraft) -> Result<Message>;

    async fn fetch_group_members(&self, group_id: &str) -> Result<Vec<UserId>>;
}

/// What a live channel reports to its reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An opaque payload, decoded by the subscription layer.
    Payload(String),
    /// The transport dropped. The channel is dead after this.
    Disconnected(String),
}

/// Write half of an open live channel.
pub trait LiveChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Queue a payload for the other participants.
    fn send(&self, payload: String) -> Result<()>;

    fn close(&self);
}

pub struct OpenedChannel {
    pub channel: Arc<dyn LiveChannel>,
    /// Read half. Ends (returns `None`) once the transport is gone.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for OpenedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedChannel")
            .field("topic", &self.channel.topic())
            .finish()
    }
}

/// Live-update transport.
#[async_trait]
pub trait RealtimePort: Send + Sync {
    async fn open_channel(&self, topic: &str) -> Result<OpenedChannel>;
}

pub trait IdentityPort: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// Fires whenever the signed-in user changes; `None` means signed out.
    fn auth_changes(&self) -> watch::Receiver<Option<UserId>>;
}

/// Stable realtime topic for a conversation.
pub fn topic_for(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// Inverse of [`topic_for`].
pub fn conversation_for(topic: &str) -> Option<ConversationId> {
    topic
        .strip_prefix("conversation:")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_is_stable_per_conversation() {
        assert_eq!(topic_for("g1"), topic_for("g1"));
        assert_eq!(topic_for("g1"), "conversation:g1");
        assert_eq!(conversation_for("conversation:g1").as_deref(), Some("g1"));
        assert_eq!(conversation_for("conversation:"), None);
        assert_eq!(conversation_for("presence:g1"), None);
    }
}
