//! Error types for the security core

use std::time::Duration;
use thiserror::Error;

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;

/// Security errors
///
/// Token variants are kept apart so the audit trail can tell them apart; the
/// edge collapses them into a single "unauthorized" signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Unknown identity or wrong password (never says which)
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Cipher or key failure while sealing a field
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Short input, bad encoding or tag mismatch while opening a field
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Password hashing failed
    #[error("Hashing error: {0}")]
    Hashing(String),

    /// Signing a token failed
    #[error("Token signing error: {0}")]
    TokenSigning(String),

    /// Token is past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Token could not be parsed into session claims
    #[error("Token malformed: {0}")]
    TokenMalformed(String),

    /// Token was signed with an algorithm other than the expected one
    #[error("Token algorithm mismatch")]
    TokenAlgorithmMismatch,

    /// Token signature did not verify
    #[error("Token signature invalid")]
    TokenSignatureInvalid,

    /// Too many attempts for one key inside the window
    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs().max(1))]
    RateLimitExceeded {
        /// Time until the window resets
        retry_after: Duration,
    },

    /// Identity store lookup failed during refresh
    #[error("Refresh lookup failed: {0}")]
    RefreshLookupFailed(String),

    /// Audit consumer has shut down
    #[error("Audit queue closed")]
    AuditQueueClosed,

    /// Audit sink write failed
    #[error("Audit sink error: {0}")]
    AuditSink(String),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SecurityError {
    /// True for every token validation failure
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            SecurityError::TokenExpired
                | SecurityError::TokenMalformed(_)
                | SecurityError::TokenAlgorithmMismatch
                | SecurityError::TokenSignatureInvalid
        )
    }

    /// Short label for logs and audit metadata
    pub fn kind(&self) -> &'static str {
        match self {
            SecurityError::InvalidCredentials => "invalid_credentials",
            SecurityError::Encryption(_) => "encryption",
            SecurityError::Decryption(_) => "decryption",
            SecurityError::Hashing(_) => "hashing",
            SecurityError::TokenSigning(_) => "token_signing",
            SecurityError::TokenExpired => "token_expired",
            SecurityError::TokenMalformed(_) => "token_malformed",
            SecurityError::TokenAlgorithmMismatch => "token_algorithm_mismatch",
            SecurityError::TokenSignatureInvalid => "token_signature_invalid",
            SecurityError::RateLimitExceeded { .. } => "rate_limit",
            SecurityError::RefreshLookupFailed(_) => "refresh_lookup_failed",
            SecurityError::AuditQueueClosed => "audit_queue_closed",
            SecurityError::AuditSink(_) => "audit_sink",
            SecurityError::Config(_) => "config",
        }
    }
}
