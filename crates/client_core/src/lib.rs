use shared::domain::{ConnectionState, MessageId, MessageStatus, TempId};

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod message_log;
pub mod send_pipeline;
pub mod session;
pub mod status_sync;
pub mod transport;
pub mod types;

pub use api::{HttpMessagingApi, MessagingApi};
pub use config::{ClientConfig, DeliveryRoute, ReadPolicy};
pub use error::{MessagingError, Result};
pub use message_log::HistoryMerge;
pub use send_pipeline::{SendReceipt, SendTarget};
pub use session::{MessagingSession, SessionIdentity};
pub use transport::{ConnectionManager, TransportEvent};
pub use types::{ConversationEntry, ConversationKey, Message};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    MessageUpserted {
        conversation: ConversationKey,
        message: Message,
    },
    MessageStatusChanged {
        conversation: ConversationKey,
        message_id: MessageId,
        status: MessageStatus,
    },
    MessageDiscarded {
        conversation: ConversationKey,
        temp_id: TempId,
    },
    ConversationsUpdated,
    HistoryMerged {
        conversation: ConversationKey,
        merge: HistoryMerge,
    },
    SendFailed {
        temp_id: TempId,
        reason: String,
    },
    /// The credential was rejected. The session will not reconnect on its own.
    AuthenticationFailed(String),
    Error(String),
}
