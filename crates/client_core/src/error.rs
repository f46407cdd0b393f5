use shared::domain::{ConversationId, MessageId, MessageStatus, TempId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// The server rejected the credential. Terminal until re-authentication.
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("connection is not established")]
    NotConnected,
    #[error("invalid message content: {0}")]
    InvalidContent(String),
    #[error("send {temp_id} was not acknowledged after {attempts} attempts")]
    SendTimeout { temp_id: TempId, attempts: u32 },
    #[error("status sync to {status} failed for message {message_id}: {reason}")]
    StatusSync {
        message_id: MessageId,
        status: MessageStatus,
        reason: String,
    },
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Api(#[from] anyhow::Error),
}

impl MessagingError {
    /// Errors that no amount of retrying will resolve.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessagingError::Authentication(_) | MessagingError::InvalidContent(_)
        )
    }
}
