//! Error types for fmbridge-core.
//!
//! The taxonomy mirrors how the poll loop reacts to each failure:
//!
//! | Error | Steady-state handling |
//! |-------|-----------------------|
//! | [`Error::AuthenticationRequired`] | Gates polling; intentional idle, not an operator error |
//! | [`Error::AuthenticationRejected`] | Recoverable only by the operator re-running `init` |
//! | [`Error::Transient`] | Retried with backoff, then again next cycle |
//! | [`Error::Decryption`] | Skip the report, continue the cycle |
//! | [`Error::Plist`] | Skip the file, continue the scan |
//! | [`Error::Key`] | Fatal at startup (bad configuration) |
//! | [`Error::Store`] / [`Error::StoreFormat`] | Surface to the caller; session material unusable |
//!
//! Nothing in this taxonomy terminates the process once polling has begun.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the bridge pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The session is not in the `authenticated` state.
    ///
    /// This gates polling rather than signalling a fault; the scheduler
    /// idles on it until the operator completes the init flow.
    #[error("Authentication required: session is not ready")]
    AuthenticationRequired,

    /// Apple rejected the submitted credentials or 2FA code.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// A transient network failure (timeout, connection error, 5xx).
    #[error("Transient failure in '{operation}': {message}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// A collaborator answered with something the bridge cannot interpret.
    #[error("Unexpected response from '{operation}': {message}")]
    Protocol {
        /// The operation that received the response.
        operation: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A report could not be decrypted with the beacon's key.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// A plist export file could not be read or parsed.
    #[error("Unusable plist file {path}: {message}")]
    Plist {
        /// The file that was skipped.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// Configured beacon key material is invalid.
    #[error("Invalid beacon key: {0}")]
    Key(String),

    /// Credential store I/O failure.
    #[error("Credential store I/O at {path}: {source}")]
    Store {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Persisted session material could not be encoded or decoded.
    #[error("Credential store format: {0}")]
    StoreFormat(#[from] serde_json::Error),
}

impl Error {
    /// Create a transient failure with operation context.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a protocol mismatch error with operation context.
    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a decryption error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    /// Classify a reqwest failure for an operation.
    ///
    /// Every transport-level failure is transient from the pipeline's point
    /// of view; HTTP status handling happens where the status is observed.
    pub fn from_reqwest(operation: impl Into<String>, err: reqwest::Error) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// Only transient network failures qualify; everything else either
    /// needs operator action or will fail identically on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<fmbridge_types::ParseError> for Error {
    fn from(err: fmbridge_types::ParseError) -> Self {
        Self::Decryption(err.to_string())
    }
}

/// Result type alias using fmbridge-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::AuthenticationRequired;
        assert_eq!(err.to_string(), "Authentication required: session is not ready");

        let err = Error::transient("fetch_reports", "connection reset");
        assert!(err.to_string().contains("fetch_reports"));
        assert!(err.to_string().contains("connection reset"));

        let err = Error::decryption("tag mismatch");
        assert_eq!(err.to_string(), "Decryption failed: tag mismatch");
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::transient("x", "y").is_retryable());
        assert!(!Error::AuthenticationRequired.is_retryable());
        assert!(!Error::AuthenticationRejected("bad code".into()).is_retryable());
        assert!(!Error::decryption("oops").is_retryable());
        assert!(!Error::Key("short".into()).is_retryable());
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = fmbridge_types::ParseError::InsufficientBytes {
            expected: 10,
            actual: 3,
        };
        let err: Error = parse.into();
        assert!(matches!(err, Error::Decryption(_)));
    }
}
