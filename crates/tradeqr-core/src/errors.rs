//! Error types for the pairing-session protocol.
//!
//! Every failure a lifecycle operation can return is a [`SessionError`].
//! Each variant belongs to exactly one [`ErrorCategory`], which the boundary
//! layer uses to decide what the caller may see.

use thiserror::Error;

use crate::code::CodeError;
use crate::rate_limit::RateLimitError;
use crate::store::StoreError;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller-correctable input, rejected before any mutation.
    Validation,
    /// The transition is illegal for the session's current state.
    StateConflict,
    /// The caller is not the right participant.
    Authorization,
    /// The caller exhausted a budget.
    ResourceExhausted,
    /// Store, limiter or entropy source failure. Never echoed to callers.
    Infrastructure,
}

/// Errors returned by [`crate::SessionManager`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("pairing code generation failed: {0}")]
    Generation(String),

    #[error("pairing code not found")]
    CodeNotFound,

    #[error("session has expired")]
    SessionExpired,

    #[error("session is no longer accepting participants")]
    SessionNotJoinable,

    #[error("cannot join your own session")]
    SelfJoinForbidden,

    #[error("session is full")]
    SessionFull,

    #[error("not a participant in this session")]
    NotAParticipant,

    #[error("session not found")]
    SessionNotFound,

    #[error("only the session creator can cancel")]
    OnlyCreatorMayCancel,

    #[error("cannot cancel a completed session")]
    AlreadyCompleted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RateLimiter(#[from] RateLimitError),
}

impl From<CodeError> for SessionError {
    fn from(e: CodeError) -> Self {
        SessionError::Generation(e.to_string())
    }
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Validation(_) | SessionError::SelfJoinForbidden => {
                ErrorCategory::Validation
            }
            SessionError::SessionExpired
            | SessionError::SessionNotJoinable
            | SessionError::SessionFull
            | SessionError::AlreadyCompleted
            | SessionError::CodeNotFound
            | SessionError::SessionNotFound => ErrorCategory::StateConflict,
            SessionError::NotAParticipant | SessionError::OnlyCreatorMayCancel => {
                ErrorCategory::Authorization
            }
            SessionError::RateLimitExceeded { .. } => ErrorCategory::ResourceExhausted,
            SessionError::Generation(_)
            | SessionError::Store(_)
            | SessionError::RateLimiter(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Whether the message may be shown to the caller verbatim.
    pub fn is_public(&self) -> bool {
        self.category() != ErrorCategory::Infrastructure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors_are_not_public() {
        let store: SessionError = StoreError::OperationFailed("disk I/O error".into()).into();
        assert_eq!(store.category(), ErrorCategory::Infrastructure);
        assert!(!store.is_public());

        let limiter: SessionError = RateLimitError::Unavailable("redis down".into()).into();
        assert!(!limiter.is_public());

        let entropy: SessionError = CodeError::Entropy("no rng".into()).into();
        assert!(matches!(entropy, SessionError::Generation(_)));
        assert!(!entropy.is_public());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SessionError::Validation("bad".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(SessionError::SessionFull.category(), ErrorCategory::StateConflict);
        assert_eq!(
            SessionError::OnlyCreatorMayCancel.category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            SessionError::RateLimitExceeded { retry_after_secs: 5 }.category(),
            ErrorCategory::ResourceExhausted
        );
    }
}
