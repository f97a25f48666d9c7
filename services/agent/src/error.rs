//! Agent-wide error kinds.
//!
//! Errors cross component boundaries only as [`AgentError`] kinds; transport
//! and library error types never leak past the module that produced them.
//! Every kind carries a policy (see the match arms in the agent loop):
//!
//! | Kind              | Retryable | Policy                                      |
//! |-------------------|-----------|---------------------------------------------|
//! | Unauthenticated   | false     | logout semantics, re-prompt for token       |
//! | Transient         | true      | caller-specific retry / next scheduled run  |
//! | InvalidCursor     | false     | watermark reset + re-initialization         |
//! | PermanentStream   | false     | stop reconnecting, badge ERR                |
//! | Decrypt           | false     | keep envelope, surface diagnostic           |
//! | Registration      | false     | non-fatal for bootstrap, retried next run   |
//! | Rejected          | false     | surfaced to the caller, no retry            |
//! | Internal          | false     | log at ERROR, never crash the agent         |

use thiserror::Error;

/// Classified failure kinds shared by every subsystem.
///
/// `Clone` is required so a single-flight initialization result can be
/// handed to every concurrent caller; message payloads are plain strings
/// for the same reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// HTTP 401 from any REST call. Never retried.
    #[error("unauthenticated: access token rejected")]
    Unauthenticated,

    /// Network errors, timeouts, 5xx.
    #[error("transient: {0}")]
    Transient(String),

    /// The pushes endpoint rejected our `modified_after` continuation.
    #[error("invalid cursor: incremental watermark no longer valid")]
    InvalidCursor,

    /// Stream closed with a non-recoverable close code.
    #[error("permanent stream failure (close code {code})")]
    PermanentStream { code: u16 },

    /// An E2E envelope could not be decrypted. The push is kept.
    #[error("decrypt failure: {0}")]
    Decrypt(#[from] DecryptError),

    /// Device registration failed; bootstrap continues without it.
    #[error("device registration failed: {0}")]
    Registration(String),

    /// Non-401 4xx REST rejection. Not retryable.
    #[error("request rejected (http {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Invariant violation or unexpected local failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the next scheduled run may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        AgentError::Internal(msg.to_string())
    }
}

/// Why an E2E envelope failed to decrypt.
///
/// None of these drop the push from the display list; the envelope is
/// retained so a later password change can still decrypt it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("no encryption password configured")]
    MissingPassword,
    #[error("envelope is not valid base64")]
    Base64,
    #[error("envelope too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("authentication tag mismatch (wrong password?)")]
    BadCiphertext,
    #[error("decrypted payload is not UTF-8 JSON")]
    BadPlaintext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(AgentError::Transient("timeout".into()).is_transient());
        assert!(!AgentError::Unauthenticated.is_transient());
        assert!(!AgentError::InvalidCursor.is_transient());
        assert!(!AgentError::PermanentStream { code: 4001 }.is_transient());
    }

    #[test]
    fn decrypt_errors_convert() {
        let e: AgentError = DecryptError::MissingPassword.into();
        assert_eq!(e, AgentError::Decrypt(DecryptError::MissingPassword));
    }
}
