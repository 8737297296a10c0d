//! Error types for data parsing in fmbridge-types.

use thiserror::Error;

/// Errors that can occur when parsing decrypted report payloads.
///
/// This error type is transport-agnostic and does not include HTTP or
/// crypto errors (those belong in fmbridge-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Failed to parse data due to insufficient bytes.
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Expected data size.
        expected: usize,
        /// Actual data size received.
        actual: usize,
    },

    /// A field decoded to a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using fmbridge-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
