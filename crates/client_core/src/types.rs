use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, TempId, UserId},
    protocol::MessagePayload,
};

/// Identifies a conversation on the client. A conversation the server has not
/// assigned an id to yet is keyed by its peer, which is unique per self.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    Confirmed(ConversationId),
    Provisional(UserId),
}

impl ConversationKey {
    pub fn conversation_id(self) -> Option<ConversationId> {
        match self {
            ConversationKey::Confirmed(id) => Some(id),
            ConversationKey::Provisional(_) => None,
        }
    }

    pub fn is_provisional(self) -> bool {
        matches!(self, ConversationKey::Provisional(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Confirmed(id) => write!(f, "{id}"),
            ConversationKey::Provisional(peer) => write!(f, "provisional:{peer}"),
        }
    }
}

impl From<ConversationId> for ConversationKey {
    fn from(value: ConversationId) -> Self {
        ConversationKey::Confirmed(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MessageKey {
    Confirmed(MessageId),
    Provisional(TempId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Confirmed(id) => write!(f, "{id}"),
            MessageKey::Provisional(temp_id) => write!(f, "{temp_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub temp_id: Option<TempId>,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub fn pending(
        conversation: ConversationKey,
        temp_id: TempId,
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: None,
            temp_id: Some(temp_id),
            conversation,
            sender_id,
            receiver_id,
            content: content.into(),
            created_at,
            status: MessageStatus::Pending,
        }
    }

    pub fn from_payload(payload: &MessagePayload) -> Self {
        Self {
            message_id: Some(payload.message_id),
            temp_id: payload.temp_id.clone(),
            conversation: ConversationKey::Confirmed(payload.conversation_id),
            sender_id: payload.sender_id,
            receiver_id: payload.receiver_id,
            content: payload.content.clone(),
            created_at: payload.created_at,
            status: payload.effective_status(),
        }
    }

    pub fn key(&self) -> MessageKey {
        match (self.message_id, &self.temp_id) {
            (Some(id), _) => MessageKey::Confirmed(id),
            (None, Some(temp_id)) => MessageKey::Provisional(temp_id.clone()),
            (None, None) => MessageKey::Provisional(TempId(String::new())),
        }
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, MessageKey) {
        (self.created_at, self.key())
    }

    pub fn is_provisional(&self) -> bool {
        self.message_id.is_none()
    }

    pub fn is_inbound_for(&self, self_id: UserId) -> bool {
        self.receiver_id == self_id && self.sender_id != self_id
    }

    pub fn peer_of(&self, self_id: UserId) -> UserId {
        if self.sender_id == self_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationEntry {
    pub key: ConversationKey,
    pub peer_id: UserId,
    pub peer_display_name: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}
