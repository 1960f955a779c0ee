//! Error types for this crate.

use std::fmt::Display;

use futures_channel::oneshot;

use crate::backend::AdapterState;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A command was attempted while the adapter was not powered on.
    AdapterNotReady(AdapterState),
    /// An error reported by the adapter backend, delivered on the same
    /// channel as the corresponding success case.
    Protocol(ProtocolError),
    /// A completion event arrived with no matching pending operation.
    ///
    /// This signals a broken correlation invariant: the backend
    /// delivered an unexpected or duplicate callback. The affected
    /// link session is torn down and will not accept further requests.
    QueueCorruption,
    /// The operation is deliberately unimplemented.
    Unsupported,
    /// The operation was canceled.
    Canceled,
    /// A broadcast channel lagged.
    Lagged,
}

/// An error reported by the adapter backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend error: {}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for Error {}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::AdapterNotReady(state) => {
                write!(f, "adapter is not ready (state: {state:?})")
            }
            ErrorKind::Protocol(error) => error.fmt(f),
            ErrorKind::QueueCorruption => {
                f.write_str("completion event with no matching pending operation")
            }
            ErrorKind::Unsupported => f.write_str("operation is not supported"),
            ErrorKind::Canceled => f.write_str("canceled"),
            ErrorKind::Lagged => f.write_str("lagged"),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}

impl From<ProtocolError> for Error {
    fn from(error: ProtocolError) -> Self {
        ErrorKind::Protocol(error).into()
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_value: oneshot::Canceled) -> Self {
        ErrorKind::Canceled.into()
    }
}

impl From<async_broadcast::RecvError> for Error {
    fn from(_value: async_broadcast::RecvError) -> Self {
        ErrorKind::Lagged.into()
    }
}

impl Error {
    /// Returns the kind of error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// If this is a backend-reported error, returns a reference to it.
    pub fn get_ref(&self) -> Option<&ProtocolError> {
        match &self.kind {
            ErrorKind::Protocol(error) => Some(error),
            _ => None,
        }
    }

    /// If this is a backend-reported error, returns the underlying `ProtocolError`.
    pub fn into_inner(self) -> Option<ProtocolError> {
        match self.kind {
            ErrorKind::Protocol(error) => Some(error),
            _ => None,
        }
    }
}
