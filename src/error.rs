//! `pgmux` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    common::ByteStr,
    config::ParseError,
    encode::BindError,
    postgres::{DatabaseError, ProtocolError},
};

/// A specialized [`Result`] type for `pgmux` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `pgmux` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The server error carried by this error, if any.
    pub fn as_db_error(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) | ErrorKind::Cancelled(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error is a cancellation, by user request or timeout.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled(_))
    }

    pub(crate) fn invalid_state(op: &'static str, state: &'static str) -> Error {
        InvalidState { op, state }.into()
    }
}

/// All possible error kind from the `pgmux` library.
pub enum ErrorKind {
    /// Config url parsing failed.
    Config(ParseError),
    /// The backend byte stream made no sense; the session is broken.
    Protocol(ProtocolError),
    /// The underlying duplex failed; the session is broken.
    Io(io::Error),
    /// The server rejected a command; the session stays usable.
    Database(DatabaseError),
    /// The server aborted the command on user request (SQLSTATE 57014).
    Cancelled(DatabaseError),
    /// The session broke while this command was pending on it.
    Broken(BrokenError),
    /// Invalid command arguments, rejected before any I/O.
    Argument(ArgumentError),
    /// Operation attempted in the wrong session or reader state.
    InvalidState(InvalidState),
    /// The server demands an authentication scheme out of engine scope.
    UnsupportedAuth(UnsupportedAuth),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<BrokenError>e => ErrorKind::Broken(e));
from!(<ArgumentError>e => ErrorKind::Argument(e));
from!(<BindError>e => ErrorKind::Argument(ArgumentError::Bind(e)));
from!(<InvalidState>e => ErrorKind::InvalidState(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));

// a user cancellation only differs from any other server abort by SQLSTATE
from!(<DatabaseError>e => match e.is_query_canceled() {
    true => ErrorKind::Cancelled(e),
    false => ErrorKind::Database(e),
});

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Cancelled(e) => write!(f, "query canceled: {e}"),
            Self::Broken(e) => e.fmt(f),
            Self::Argument(e) => e.fmt(f),
            Self::InvalidState(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The session failed as a whole.
///
/// One failure is formatted once and cloned to every slot that was pending
/// on the session, in FIFO order.
#[derive(Debug, Clone, thiserror::Error)]
#[error("session broken: {reason}")]
pub struct BrokenError {
    reason: ByteStr,
}

impl BrokenError {
    pub(crate) fn new(cause: &dyn fmt::Display) -> Self {
        Self { reason: cause.to_string().into() }
    }

    pub(crate) fn closed() -> Self {
        Self { reason: ByteStr::from_static("connection closed") }
    }

    pub(crate) fn cancel_timeout() -> Self {
        Self { reason: ByteStr::from_static("write lock unavailable within cancellation timeout") }
    }

    pub(crate) fn drain_timeout() -> Self {
        Self { reason: ByteStr::from_static("close could not synchronize within the drain timeout") }
    }

    pub(crate) fn session_dropped() -> Self {
        Self { reason: ByteStr::from_static("session dropped") }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Invalid command arguments, detected before any byte hits the wire.
#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("conflicting execution flags: {0}")]
    FlagConflict(&'static str),
    #[error("command has no statements")]
    EmptyCommand,
}

/// Operation attempted in the wrong state.
#[derive(Debug, thiserror::Error)]
#[error("cannot {op}: {state}")]
pub struct InvalidState {
    pub(crate) op: &'static str,
    pub(crate) state: &'static str,
}

/// The server demands an authentication scheme the engine does not speak.
#[derive(Debug, thiserror::Error)]
#[error("unsupported authentication method: {method}")]
pub struct UnsupportedAuth {
    pub(crate) method: &'static str,
}
