//! Typed error hierarchy for the dispatcher core.
//!
//! Table and codec operations return [`Error`] so callers can map failures
//! onto protocol-level ACK/NAK without inspecting raw OS error codes. The
//! binary entry point wraps these (and anything else) in `anyhow::Error` for
//! a single top-level report.

use thiserror::Error;

/// The kind of failure a core operation can produce.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// A selector or message field violated a precondition.
    #[error("invalid argument")]
    InvalidArgument,
    /// A subscription would overlap one already registered.
    #[error("already registered")]
    AlreadyRegistered,
    /// No subscription matches the given selector.
    #[error("not found")]
    NotFound,
    /// The peer closed the connection (zero-length read).
    #[error("peer closed")]
    PeerClosed,
    /// A frame's tag was not legal in the current exchange.
    #[error("bad message")]
    BadMessage,
    /// An I/O error occurred on the transport.
    #[error("transport error")]
    Transport,
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation was interrupted and should be retried.
    #[error("transient error")]
    Transient,
}

/// An error produced by the dispatcher core.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn already_registered(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyRegistered, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn peer_closed() -> Self {
        Self::new(ErrorKind::PeerClosed, "peer closed connection")
    }

    pub fn bad_message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadMessage, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::Interrupted {
            Error::transient(e.to_string())
        } else {
            Error::transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
