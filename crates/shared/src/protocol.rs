use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, MessageStatus, TempId, UserId, UserSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(alias = "id")]
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub seen: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl MessagePayload {
    /// Furthest status indicated by either the `status` field or the boolean
    /// flags. A confirmed payload is never below `sent`.
    pub fn effective_status(&self) -> MessageStatus {
        let mut status = match self.status {
            Some(status) if status.has_reached(MessageStatus::Sent) => status,
            _ => MessageStatus::Sent,
        };
        for (flag, flagged) in [
            (self.delivered, MessageStatus::Delivered),
            (self.seen, MessageStatus::Seen),
            (self.read, MessageStatus::Read),
        ] {
            if flag && flagged.is_after(status) {
                status = flagged;
            }
        }
        status
    }

    pub fn peer_of(&self, self_id: UserId) -> UserId {
        if self.sender_id == self_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message {
        message: MessagePayload,
    },
    Status {
        message_id: MessageId,
        status: MessageStatus,
    },
}

impl InboundFrame {
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Frame written by the client. The conversation is implicit from the
/// receiver until the server has assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub temp_id: TempId,
}

impl OutboundFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    #[serde(default)]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub other_user: Option<UserSummary>,
    #[serde(default)]
    pub last_message_content: Option<String>,
}

impl ConversationSummary {
    pub fn peer_id(&self, self_id: UserId) -> UserId {
        if self.user1_id == self_id {
            self.user2_id
        } else {
            self.user1_id
        }
    }

    pub fn peer_display_name(&self) -> Option<String> {
        self.other_user
            .as_ref()
            .and_then(|user| user.username.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConversationRequest {
    pub user2_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub receiver_id: UserId,
    pub content: String,
    pub temp_id: TempId,
}

impl From<&OutboundFrame> for SendMessageRequest {
    fn from(frame: &OutboundFrame) -> Self {
        Self {
            conversation_id: frame.conversation_id,
            receiver_id: frame.receiver_id,
            content: frame.content.clone(),
            temp_id: frame.temp_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub skip: u32,
    pub limit: u32,
}

impl HistoryPage {
    pub const MAX_LIMIT: u32 = 100;

    pub fn first(limit: u32) -> Self {
        Self {
            skip: 0,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn next(self) -> Self {
        Self {
            skip: self.skip.saturating_add(self.limit),
            limit: self.limit,
        }
    }
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self::first(Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
}
