use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status codes carried by a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The call completed successfully. Never carried by a [`Status`] on the wire.
    Ok,
    Canceled,
    InvalidArgument,
    DeadlineExceeded,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Canceled => "canceled",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        }
    }

    /// Returns true for the codes produced by deadlines and explicit cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Code::Canceled | Code::DeadlineExceeded)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-coded call failure.
///
/// Handlers return it to fail a call; it travels to the caller as the call's
/// single terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Call failed: {0}")]
    Status(#[from] Status),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RpcError {
    /// Maps the error onto the status code a caller should branch on.
    pub fn code(&self) -> Code {
        match self {
            RpcError::Status(status) => status.code(),
            RpcError::ConnectionError(_) | RpcError::StreamError(_) | RpcError::IoError(_) => {
                Code::Unavailable
            }
            RpcError::ProtocolError(_)
            | RpcError::TlsError(_)
            | RpcError::SerializationError(_)
            | RpcError::ConfigError(_)
            | RpcError::InternalError(_) => Code::Internal,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.code() == Code::DeadlineExceeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.code() == Code::Canceled
    }

    /// True when the stream itself broke, typically because the peer has
    /// already finished its side of the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionError(_) | RpcError::StreamError(_) | RpcError::IoError(_)
        )
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Status(status) => status,
            RpcError::SerializationError(e) => {
                Status::invalid_argument(format!("malformed message: {e}"))
            }
            other => Status::new(other.code(), other.to_string()),
        }
    }
}
