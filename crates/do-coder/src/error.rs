//! Coder error types

use do_signature::SignatureError;
use thiserror::Error;

/// Encoding and decoding errors
#[derive(Debug, Error)]
pub enum CoderError {
    /// Malformed, truncated or unexpected input
    #[error("decoding error at offset {offset}: {message}")]
    Decoding { offset: usize, message: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    /// A conditional reference was never matched by the object it names
    #[error("unsatisfied forward reference {0}")]
    UnsatisfiedForwardReference(u32),

    /// An earlier error already aborted this session
    #[error("coder session aborted by an earlier error")]
    SessionAborted,

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl CoderError {
    pub(crate) fn decoding(offset: usize, message: impl Into<String>) -> Self {
        CoderError::Decoding {
            offset,
            message: message.into(),
        }
    }
}

/// Result type for coder operations
pub type Result<T> = std::result::Result<T, CoderError>;
