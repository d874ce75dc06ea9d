//! Error types for gremlin-session
//!
//! One taxonomy for the whole connection layer. Variants split into two
//! groups: failures that compromise the connection (`Write`, `Read`) and
//! failures scoped to a single request (everything else).

use std::fmt;
use std::time::Duration;

/// How a read ended when no data message could be returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// The peer completed the close handshake (or the stream ended cleanly)
    ClosedByPeer(Option<String>),
    /// Reset, protocol violation, or read deadline elapsed
    Abnormal(String),
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer(Some(reason)) => write!(f, "closed by peer: {reason}"),
            Self::ClosedByPeer(None) => write!(f, "closed by peer"),
            Self::Abnormal(msg) => write!(f, "abnormal disconnect: {msg}"),
        }
    }
}

/// Main error type for session operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Read error: {0}")]
    Read(ReadFailure),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed while request was outstanding")]
    ConnectionClosed,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Usage error: {0}")]
    Usage(String),
}

impl SessionError {
    /// Whether this error means the whole connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Write(_) | Self::Read(_) | Self::ConnectionClosed | Self::SessionClosed
        )
    }

    /// Whether the peer closed the connection cleanly.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Read(ReadFailure::ClosedByPeer(_)))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Write(err.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
