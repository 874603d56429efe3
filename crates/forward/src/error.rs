use std::net::SocketAddr;

use thiserror::Error;

use crate::tunnel::StreamKind;

/// Direction of a byte copy inside a stream pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local connection into the data stream.
    LocalToRemote,
    /// Data stream into the local connection.
    RemoteToLocal,
    /// Draining the remote error stream.
    ErrorStream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalToRemote => write!(f, "local->remote"),
            Self::RemoteToLocal => write!(f, "remote->local"),
            Self::ErrorStream => write!(f, "error-stream"),
        }
    }
}

/// Failure to turn a mapping target into a live backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no ready backend found: {0}")]
    NotFound(String),

    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

/// Failure to establish a tunnel connection to a resolved backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to dial backend {backend}: {message}")]
pub struct DialError {
    pub backend: String,
    pub message: String,
}

impl DialError {
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Failure to open one logical stream on a tunnel connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to open {kind} stream: {message}")]
pub struct StreamOpenError {
    pub kind: StreamKind,
    pub message: String,
}

impl StreamOpenError {
    pub fn new(kind: StreamKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors produced by sessions and stream pumps.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    StreamOpen(#[from] StreamOpenError),

    #[error("I/O error copying {direction}: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("remote reported an error: {remote_message}")]
    Protocol { remote_message: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel to {backend} was lost")]
    TunnelLost { backend: String },

    #[error("invalid port mapping: {0}")]
    InvalidMapping(String),

    #[error("cancelled")]
    Cancelled,
}

impl ForwardError {
    pub(crate) fn io(direction: Direction, source: std::io::Error) -> Self {
        Self::Io { direction, source }
    }

    /// Whether the listener must be rebound before the next cycle.
    pub fn is_listener_error(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Accept { .. })
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;
