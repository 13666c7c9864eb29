// src/error.rs
use crate::parser::ParseError;
use std::io;
use std::os::unix::io::RawFd;

/// Central error type for the mazurka engine.
#[derive(Debug, thiserror::Error)]
pub enum MazurkaError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error while parsing the HTTP request.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The descriptor is already registered with the reactor.
    #[error("descriptor {0} is already subscribed")]
    AlreadySubscribed(RawFd),

    /// The descriptor is not registered with the reactor.
    #[error("descriptor {0} is not subscribed")]
    NotSubscribed(RawFd),

    /// The tick subscriber is already on the reactor's tick list.
    #[error("tick subscriber is already present")]
    TickPresent,

    /// The peer closed the connection before the exchange finished.
    #[error("connection closed by peer")]
    PeerClosed,

    /// The connection was cancelled while suspended.
    #[error("connection cancelled")]
    Cancelled,

    /// UNIX socket path does not fit in sockaddr_un.
    #[error("socket path too long: {0}")]
    PathTooLong(String),
}

impl MazurkaError {
    /// True for interrupt-class wake-ups (EINTR) that the event loop retries.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, MazurkaError::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

pub type MazurkaResult<T> = Result<T, MazurkaError>;
