//! Error types for encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding persisted data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The data was written by an unknown format version.
    #[error("unsupported {kind} format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Which snapshot was being decoded.
        kind: &'static str,
        /// Version found in the data.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// A value parsed but violates a structural rule.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl CodecError {
    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
