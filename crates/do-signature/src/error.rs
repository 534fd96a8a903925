//! Error types for method signatures and call frames

use thiserror::Error;

/// Signature and call-frame errors
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid signature at byte {position}: {message}")]
    InvalidSignature { position: usize, message: String },

    #[error("argument index {index} out of range (frame has {count} arguments)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("size mismatch for argument {index}: slot holds {expected} bytes, got {got}")]
    SizeMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("frame length mismatch: expected {expected} bytes, got {got}")]
    FrameLength { expected: usize, got: usize },

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("invocation error: {0}")]
    Invocation(String),
}

impl SignatureError {
    pub(crate) fn invalid(position: usize, message: impl Into<String>) -> Self {
        SignatureError::InvalidSignature {
            position,
            message: message.into(),
        }
    }
}

/// Result type for signature operations
pub type Result<T> = std::result::Result<T, SignatureError>;
