//! Error types for ports and framing

use thiserror::Error;

/// Port error types
#[derive(Debug, Error)]
pub enum PortError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("port invalid")]
    PortInvalid,

    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },
}

pub type Result<T> = std::result::Result<T, PortError>;
