//! Error values surfaced by the engine.
//!
//! Every failure the engine reports is one of the [`Error`] variants below.
//! Callers are expected to branch on the variant, never on the message text,
//! which is why `Error` compares by kind:
//!
//! ```
//! use evnet::Error;
//!
//! let err = evnet::Engine::default().validate().unwrap_err();
//! assert_eq!(err, Error::EmptyEngine);
//! ```

use std::fmt;
use std::io;

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds reported by the engine.
#[derive(Debug)]
pub enum Error {
    /// The engine holds no listeners, so there is nothing to operate on.
    EmptyEngine,
    /// Shutdown has begun or completed, or the engine to stop is unknown.
    EngineInShutdown,
    /// A handler asked the engine to shut down.
    EngineShutdown,
    /// The operation is meaningless for the current configuration.
    UnsupportedOp,
    /// Malformed address, or a registration that names no endpoint.
    InvalidNetworkAddress,
    /// More event loops were requested than OS-thread locking allows.
    TooManyEventLoopThreads,
    /// The address scheme is not one of unix, tcp{,4,6}, udp{,4,6}.
    UnsupportedProtocol,
    /// The caller's [`Context`](crate::Context) was canceled.
    Canceled,
    /// The caller's [`Context`](crate::Context) deadline passed.
    DeadlineExceeded,
    /// An OS-level failure.
    Io(io::Error),
}

impl Error {
    /// Returns `true` for the two cancellation kinds of a [`Context`](crate::Context).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    pub(crate) fn stale() -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection is closed or its slot was reused",
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyEngine => write!(f, "evnet: the internal engine is empty"),
            Error::EngineInShutdown => write!(f, "evnet: engine is in shutdown"),
            Error::EngineShutdown => write!(f, "evnet: engine is going to be shutdown"),
            Error::UnsupportedOp => write!(f, "evnet: unsupported operation"),
            Error::InvalidNetworkAddress => write!(f, "evnet: invalid network address"),
            Error::TooManyEventLoopThreads => write!(
                f,
                "evnet: too many event-loops under LockOSThread mode"
            ),
            Error::UnsupportedProtocol => write!(
                f,
                "evnet: only unix, tcp/tcp4/tcp6, udp/udp4/udp6 are supported"
            ),
            Error::Canceled => write!(f, "context canceled"),
            Error::DeadlineExceeded => write!(f, "context deadline exceeded"),
            Error::Io(e) => write!(f, "evnet: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_by_kind() {
        assert_eq!(Error::EmptyEngine, Error::EmptyEngine);
        assert_ne!(Error::EmptyEngine, Error::EngineInShutdown);
        assert_eq!(
            Error::from(io::Error::new(io::ErrorKind::WouldBlock, "a")),
            Error::from(io::Error::new(io::ErrorKind::WouldBlock, "b")),
        );
        assert_ne!(
            Error::from(io::Error::from(io::ErrorKind::WouldBlock)),
            Error::from(io::Error::from(io::ErrorKind::NotFound)),
        );
    }

    #[test]
    fn cancellation_kinds() {
        assert!(Error::Canceled.is_cancellation());
        assert!(Error::DeadlineExceeded.is_cancellation());
        assert!(!Error::EngineInShutdown.is_cancellation());
    }
}
