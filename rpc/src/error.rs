//! Error taxonomy shared by the protocol clients.

use std::path::PathBuf;

/// Failure to bring up the external process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{command} not found in PATH")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("permission denied spawning {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spawning {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Failure to decode a single frame from the byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("header block has no Content-Length")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {declared} exceeds maximum {max}")]
    Oversized { declared: usize, max: usize },
    #[error("{buffered} bytes without a header terminator (max {max})")]
    UnterminatedHeader { buffered: usize, max: usize },
    #[error("frame body is not valid JSON")]
    Json(#[source] serde_json::Error),
}

impl FrameError {
    /// Fatal errors leave the stream position unknown; the session must end.
    ///
    /// Everything else was consumed exactly and the next frame is intact.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Oversized { .. } | Self::UnterminatedHeader { .. }
        )
    }
}

/// Failure of one request-style operation, as seen by its caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out: {method}")]
    Timeout { method: String },
    #[error("{method} failed: {message}")]
    Remote {
        method: String,
        code: Option<i64>,
        message: String,
    },
    #[error("session stopped: {reason}")]
    SessionStopped { reason: String },
    #[error("session is not running")]
    NotRunning,
    #[error("another request is already in flight")]
    Busy,
    #[error("session already started")]
    AlreadyStarted,
    #[error("failed to start: {0}")]
    Spawn(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to encode {method}: {message}")]
    Encode { method: String, message: String },
    #[error("unexpected {method} response: {message}")]
    Decode { method: String, message: String },
}

impl RpcError {
    pub fn stopped(reason: impl Into<String>) -> Self {
        Self::SessionStopped {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<ProcessError> for RpcError {
    fn from(err: ProcessError) -> Self {
        Self::Spawn(err.to_string())
    }
}
