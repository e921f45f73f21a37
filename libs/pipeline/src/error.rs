use relay_dal::DalError;
use thiserror::Error;

/// Ingress rejections, surfaced to socket senders as `error` events and to
/// REST callers as structured responses. Deterministic: the same request
/// consistently succeeds or consistently fails with the same kind.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("invalid message: {0}")]
    InvalidSchema(String),
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("conversation is inactive")]
    ConversationInactive,
    #[error("sender is not an active member of the conversation")]
    NotMember,
    #[error("sender is blocked in this conversation")]
    UserBlocked,
    #[error("message content is too long ({size} of {max} bytes allowed)")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),
    #[error("partition backlog is over the high-water mark")]
    EnqueueThrottled,
    #[error("internal error")]
    Internal(String),
}

impl ProducerError {
    pub fn code(&self) -> &'static str {
        match self {
            ProducerError::InvalidSchema(_) => "invalid_schema",
            ProducerError::ConversationNotFound => "conversation_not_found",
            ProducerError::ConversationInactive => "conversation_inactive",
            ProducerError::NotMember => "not_member",
            ProducerError::UserBlocked => "user_blocked",
            ProducerError::PayloadTooLarge { .. } => "payload_too_large",
            ProducerError::EnqueueFailed(_) => "enqueue_failed",
            ProducerError::EnqueueThrottled => "enqueue_throttled",
            ProducerError::Internal(_) => "internal_error",
        }
    }
}

impl From<DalError> for ProducerError {
    fn from(err: DalError) -> Self {
        ProducerError::Internal(err.to_string())
    }
}

/// Consumer-side persistence failure classification. Transient failures are
/// retried via redelivery; permanent ones go straight to the dead-letter
/// stream.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("transient persistence failure: {0}")]
    PersistenceTransient(String),
    #[error("permanent persistence failure: {0}")]
    PersistencePermanent(String),
}

impl From<DalError> for ConsumeError {
    fn from(err: DalError) -> Self {
        // Infrastructure failures are worth redelivering; the retry limit
        // bounds how long a genuinely broken envelope can cycle.
        ConsumeError::PersistenceTransient(err.to_string())
    }
}
