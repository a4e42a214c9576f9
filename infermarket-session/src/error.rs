//! Error types for the session engine.

use thiserror::Error;

use crate::settlement::SettlementReceipt;
use crate::transport::TransportError;
use crate::types::{OperationKind, SessionId, SessionStatus};

/// Errors surfaced by the session engine.
#[derive(Debug, Error)]
pub enum SessionError {
    // ═══════════════════════════════════════════════════════════════════════════════
    // ADMISSION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("rate limited for {kind}, retry after {retry_after_ms}ms")]
    RateLimited { kind: OperationKind, retry_after_ms: u64 },

    #[error("operation timed out after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════════════════
    // SESSION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("session {session_id:?} is not active (status: {status})")]
    SessionNotActive {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("session {session_id:?} lost by host: {reason}")]
    SessionNotFound { session_id: SessionId, reason: String },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    // ═══════════════════════════════════════════════════════════════════════════════
    // CHANNEL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("replayed or out-of-order envelope: expected index {expected}, received {received}")]
    ReplayDetected { expected: u64, received: u64 },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // HOST ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("host error {code}: {message}")]
    HostError { code: String, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    // ═══════════════════════════════════════════════════════════════════════════════
    // SETTLEMENT ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("settlement of checkpoint {checkpoint_number} failed: {reason}")]
    SettlementFailed {
        checkpoint_number: u64,
        reason: String,
        /// True when the outcome on the ledger could not be determined.
        ambiguous: bool,
    },

    #[error("{tokens_used} tokens is below the billable minimum of {minimum}; session closed at zero cost")]
    InsufficientTokensForSettlement {
        tokens_used: u64,
        minimum: u64,
        receipt: Box<SettlementReceipt>,
    },

    // ═══════════════════════════════════════════════════════════════════════════════
    // CONFIGURATION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // INTERNAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{operation} on session {session_id:?}: {source}")]
    Context {
        operation: &'static str,
        session_id: SessionId,
        #[source]
        source: Box<SessionError>,
    },
}

/// Machine-readable error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailed,
    RateLimited,
    Timeout,
    Cancelled,
    SessionNotActive,
    SessionNotFound,
    UnknownSession,
    DecryptionFailed,
    ReplayDetected,
    HandshakeFailed,
    HostUnreachable,
    HostError,
    Transport,
    InsufficientFunds,
    SettlementFailed,
    InsufficientTokensForSettlement,
    InvalidConfig,
    Serialization,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            SessionError::RateLimited { .. } => ErrorKind::RateLimited,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::SessionNotActive { .. } => ErrorKind::SessionNotActive,
            SessionError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            SessionError::UnknownSession(_) => ErrorKind::UnknownSession,
            SessionError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            SessionError::ReplayDetected { .. } => ErrorKind::ReplayDetected,
            SessionError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            SessionError::HostUnreachable(_) => ErrorKind::HostUnreachable,
            SessionError::HostError { .. } => ErrorKind::HostError,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            SessionError::SettlementFailed { .. } => ErrorKind::SettlementFailed,
            SessionError::InsufficientTokensForSettlement { .. } => {
                ErrorKind::InsufficientTokensForSettlement
            }
            SessionError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SessionError::Serialization(_) => ErrorKind::Serialization,
            SessionError::Internal(_) => ErrorKind::Internal,
            SessionError::Context { source, .. } => source.kind(),
        }
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SessionError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            SessionError::Context { source, .. } => source.retry_after_ms(),
            _ => None,
        }
    }

    /// Whether the same call may succeed if repeated unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::RateLimited { .. }
            | SessionError::Timeout { .. }
            | SessionError::HostUnreachable(_)
            | SessionError::DecryptionFailed(_)
            | SessionError::Transport(_) => true,
            SessionError::SettlementFailed { ambiguous, .. } => *ambiguous,
            SessionError::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Attach the operation name and session.
    pub fn context(self, operation: &'static str, session_id: SessionId) -> Self {
        match self {
            already @ SessionError::Context { .. } => already,
            other => SessionError::Context {
                operation,
                session_id,
                source: Box::new(other),
            },
        }
    }

    /// Strip any context wrapper.
    pub fn into_root(self) -> Self {
        match self {
            SessionError::Context { source, .. } => source.into_root(),
            other => other,
        }
    }

    /// The zero-cost receipt carried by `InsufficientTokensForSettlement`.
    pub fn zero_cost_receipt(&self) -> Option<&SettlementReceipt> {
        match self {
            SessionError::InsufficientTokensForSettlement { receipt, .. } => Some(receipt),
            SessionError::Context { source, .. } => source.zero_cost_receipt(),
            _ => None,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        SessionError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_kind() {
        let id = SessionId::from_bytes([7; 32]);
        let err = SessionError::RateLimited {
            kind: OperationKind::ImageGeneration,
            retry_after_ms: 1500,
        }
        .context("send_prompt", id);

        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("send_prompt on session"));

        // A second context call keeps the innermost operation name.
        let err = err.context("outer", id);
        match &err {
            SessionError::Context { operation, .. } => assert_eq!(*operation, "send_prompt"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(err.into_root(), SessionError::RateLimited { .. }));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!SessionError::Cancelled.is_retryable());
        assert!(!SessionError::ReplayDetected { expected: 1, received: 0 }.is_retryable());
        assert!(SessionError::SettlementFailed {
            checkpoint_number: 2,
            reason: "timeout".into(),
            ambiguous: true,
        }
        .is_retryable());
        assert!(!SessionError::SettlementFailed {
            checkpoint_number: 2,
            reason: "rejected".into(),
            ambiguous: false,
        }
        .is_retryable());
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let err: SessionError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
