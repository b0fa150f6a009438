use crate::protocol::RequestId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error categories shared by the server and its clients.
///
/// The kind travels on the wire next to a human readable message so clients
/// can tell failures apart without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyRunning,
    RestartFailed,
    ServerShuttingDown,
    SessionClosed,
    InvalidCommand,
    InvalidContext,
    InvalidParams,
    DuplicateRequest,
    Cancelled,
    ConnectionLost,
    Timeout,
    Handshake,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::RestartFailed => "restart_failed",
            ErrorKind::ServerShuttingDown => "server_shutting_down",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::InvalidCommand => "invalid_command",
            ErrorKind::InvalidContext => "invalid_context",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::DuplicateRequest => "duplicate_request",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error payload carried by `response` and `disconnect` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("restart failed: {0}")]
    RestartFailed(String),

    #[error("server is shutting down")]
    ServerShuttingDown,

    #[error("session is closed")]
    SessionClosed,

    /// Message text is matched by external clients, keep the prefix stable.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("duplicate request id: {0}")]
    DuplicateRequest(RequestId),

    #[error("request cancelled")]
    Cancelled,

    #[error("connection lost")]
    ConnectionLost,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error reported by the peer, as received on the wire.
    #[error("{}", .0.message)]
    Remote(ErrorBody),

    #[error("Failed to access transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyRunning => ErrorKind::AlreadyRunning,
            Error::RestartFailed(_) => ErrorKind::RestartFailed,
            Error::ServerShuttingDown => ErrorKind::ServerShuttingDown,
            Error::SessionClosed => ErrorKind::SessionClosed,
            Error::InvalidCommand(_) => ErrorKind::InvalidCommand,
            Error::InvalidContext(_) => ErrorKind::InvalidContext,
            Error::InvalidParams(_) => ErrorKind::InvalidParams,
            Error::DuplicateRequest(_) => ErrorKind::DuplicateRequest,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ConnectionLost | Error::Io(_) => ErrorKind::ConnectionLost,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Remote(body) => body.kind,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            Error::Remote(body) => body.clone(),
            _ => ErrorBody {
                kind: self.kind(),
                message: self.to_string(),
            },
        }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::Remote(body)
    }
}

impl From<ErrorKind> for ErrorBody {
    fn from(kind: ErrorKind) -> Self {
        let message = match kind {
            ErrorKind::ServerShuttingDown => Error::ServerShuttingDown.to_string(),
            ErrorKind::SessionClosed => Error::SessionClosed.to_string(),
            ErrorKind::Cancelled => Error::Cancelled.to_string(),
            ErrorKind::ConnectionLost => Error::ConnectionLost.to_string(),
            other => other.to_string(),
        };
        ErrorBody { kind, message }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
