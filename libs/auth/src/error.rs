use thiserror::Error;

/// Enumerated verification outcomes. `code()` is the wire-visible identifier
/// used in handshake rejections and error events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotBefore,
    #[error("unauthorized")]
    Unauthorized,
    #[error("verification failed: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::Malformed => "malformed",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::InvalidIssuer => "invalid_issuer",
            AuthError::Expired => "expired",
            AuthError::NotBefore => "not_before",
            AuthError::Unauthorized => "unauthorized",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Claim-level failures outrank format failures, which outrank signature
    /// mismatches; used when several static keys were attempted so the most
    /// informative verdict survives.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            AuthError::InvalidSignature => 0,
            AuthError::Malformed => 1,
            _ => 2,
        }
    }
}

pub(crate) fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::NotBefore,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => AuthError::InvalidAudience,
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => AuthError::InvalidIssuer,
        ErrorKind::MissingRequiredClaim(_) => AuthError::Unauthorized,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::Malformed,
        ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
        other => AuthError::Internal(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::MissingToken.code(), "missing_token");
        assert_eq!(AuthError::NotBefore.code(), "not_before");
        assert_eq!(AuthError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn specificity_orders_verdicts() {
        assert!(AuthError::Expired.specificity() > AuthError::Malformed.specificity());
        assert!(AuthError::Malformed.specificity() > AuthError::InvalidSignature.specificity());
    }
}
