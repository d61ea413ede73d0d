use thiserror::Error;

use crate::message::MessageType;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(MessageType),

    #[error("Message tag mismatch: tagged as ({0}), but message is ({1})")]
    MessageTagMismatch(MessageType, MessageType),

    #[error("Wait for message was cancelled")]
    Cancelled,

    #[error("Bus is closed!")]
    BusClosed,
}

impl Error {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
