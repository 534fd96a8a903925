//! Error types for distributed objects

use do_coder::CoderError;
use do_port::PortError;
use do_signature::SignatureError;
use thiserror::Error;

/// Distributed object errors
#[derive(Debug, Error)]
pub enum DoError {
    /// The connection (or one of its ports) is dead
    #[error("connection invalid")]
    ConnectionInvalid,

    #[error("timed out waiting for reply")]
    Timeout,

    /// The remote invocation itself failed
    #[error("remote exception {name}: {reason}")]
    RemoteException { name: String, reason: String },

    #[error("{class} does not respond to {selector}")]
    UnknownSelector { class: String, selector: String },

    #[error("no exported object with target {0}")]
    ObjectNotFound(u32),

    /// The proxy was released and can no longer forward
    #[error("proxy for target {0} was released")]
    ProxyReleased(u32),

    #[error("peer vends no root object")]
    NoRootObject,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Coder(#[from] CoderError),

    #[error(transparent)]
    Port(PortError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PortError> for DoError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::PortInvalid => DoError::ConnectionInvalid,
            other => DoError::Port(other),
        }
    }
}

impl DoError {
    /// An application-level exception raised by a method body
    pub fn exception(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DoError::RemoteException {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Name under which this error crosses the wire
    pub fn exception_name(&self) -> &str {
        match self {
            DoError::RemoteException { name, .. } => name,
            DoError::UnknownSelector { .. } => "UnknownSelector",
            DoError::ObjectNotFound(_) => "ObjectNotFound",
            DoError::Signature(SignatureError::InvalidSignature { .. }) => "InvalidSignature",
            DoError::Signature(_) => "InvocationError",
            DoError::Coder(_) => "DecodingError",
            DoError::Protocol(_) => "ProtocolError",
            DoError::ConnectionInvalid => "ConnectionInvalid",
            DoError::Timeout => "Timeout",
            DoError::NoRootObject => "NoRootObject",
            DoError::ProxyReleased(_) => "ProxyReleased",
            DoError::Port(_) => "PortError",
            DoError::Io(_) => "IoError",
        }
    }

    /// Description sent along with the exception name
    pub fn exception_reason(&self) -> String {
        match self {
            DoError::RemoteException { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DoError>;
