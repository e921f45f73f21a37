use relay_dal::DalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation not found")]
    NotFound,
    #[error("not a member of this conversation")]
    NotMember,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("a conversation must keep exactly one owner")]
    LastOwner,
    #[error("storage failure")]
    Store(#[from] DalError),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotFound => "conversation_not_found",
            ChatError::NotMember => "not_member",
            ChatError::Forbidden(_) => "forbidden",
            ChatError::Validation(_) => "invalid_request",
            ChatError::LastOwner => "last_owner",
            ChatError::Store(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::NotMember.code(), "not_member");
        assert_eq!(ChatError::LastOwner.code(), "last_owner");
        assert_eq!(
            ChatError::Store(DalError::PoolExhausted).code(),
            "internal_error"
        );
    }
}
