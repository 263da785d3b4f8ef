//! Error types for the remote object proxying core.

use std::fmt;

/// Errors that can occur while operating a [`crate::Connection`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying byte stream failed, or a frame was malformed / truncated.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O failure reading or writing the stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload carried an unknown tag byte, or a tagged payload was malformed.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// An `exception` frame arrived; this wraps the peer's marshaled error.
    #[error("remote exception: {0}")]
    RemoteException(RemoteError),

    /// A request handler asked the process to exit.
    #[error("fatal exit requested with code {0}")]
    FatalExit(i32),

    /// The connection is closed; no further requests may be sent or served.
    #[error("connection closed")]
    ConnectionClosed,

    /// An internal invariant was violated (e.g. a response arrived with no
    /// outstanding handler, or the process forked under the connection).
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The marshaled form of a peer-side error, carried inside an `exception` frame.
///
/// Kept as an opaque, displayable payload rather than re-hydrating an
/// arbitrary local exception type: the core does not know what error types
/// the external dispatcher raises, only that it can describe them as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
