// JSON envelope carried over live channels
//
// Inbound payloads are decoded here; anything that does not parse into a
// known event is a ChatError::Decode and gets dropped by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::models::{Attachment, Message, MessageStatus, PresenceState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Message {
        message: WireMessage,
    },
    Typing {
        conversation_id: String,
        user_id: String,
        state: PresenceState,
    },
    Online {
        conversation_id: String,
        user_id: String,
    },
}

impl WireEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            WireEvent::Message { message } => &message.conversation_id,
            WireEvent::Typing { conversation_id, .. } => conversation_id,
            WireEvent::Online { conversation_id, .. } => conversation_id,
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        WireMessage {
            id: msg.id.clone(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            body: msg.body.clone(),
            attachment: msg.attachment.clone(),
            created_at: msg.created_at,
            correlation_id: msg.correlation_id.clone(),
        }
    }
}

impl WireMessage {
    /// Anything arriving over the wire has been committed by the backend.
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            body: self.body,
            attachment: self.attachment,
            created_at: self.created_at,
            status: MessageStatus::Sent,
            correlation_id: self.correlation_id,
        }
    }
}

pub fn decode(payload: &str) -> Result<WireEvent> {
    let event: WireEvent = serde_json::from_str(payload)?;

    if event.conversation_id().is_empty() {
        return Err(ChatError::Decode("event without conversation_id".to_string()));
    }
    match &event {
        WireEvent::Message { message } => {
            if message.id.is_empty() {
                return Err(ChatError::Decode("message without id".to_string()));
            }
            if message.sender_id.is_empty() {
                return Err(ChatError::Decode(format!("message {} without sender", message.id)));
            }
            if message.body.is_empty() && message.attachment.is_none() {
                return Err(ChatError::Decode(format!("message {} has no content", message.id)));
            }
        }
        WireEvent::Typing { user_id, .. } | WireEvent::Online { user_id, .. } => {
            if user_id.is_empty() {
                return Err(ChatError::Decode("presence event without user_id".to_string()));
            }
        }
    }
    Ok(event)
}

pub fn encode(event: &WireEvent) -> Result<String> {
    serde_json::to_string(event).map_err(|e| ChatError::Decode(e.to_string()))
}

pub fn message_event(msg: &Message) -> WireEvent {
    WireEvent::Message {
        message: WireMessage::from(msg),
    }
}

pub fn typing_event(conversation_id: &str, user_id: &str, state: PresenceState) -> WireEvent {
    WireEvent::Typing {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        state,
    }
}

pub fn online_event(conversation_id: &str, user_id: &str) -> WireEvent {
    WireEvent::Online {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
    }
}
