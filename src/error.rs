//! Crate-wide error taxonomy.
//!
//! Every public fallible operation in this crate returns `Result<T, Error>`.
//! `Error` carries one of the stable negative error codes a C FFI boundary
//! would want to hand back to a caller, plus a human-readable message.

use std::fmt;
use std::io;

/// Stable, FFI-friendly error codes. Values are negative so a caller bridging
/// to a C ABI can return `T` or a negative code from the same integer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Eof = -1000,
    Timeout = -1001,
    Io = -1002,
    Cancelled = -1003,
    Busy = -1004,
    Closed = -1005,
    BadResource = -1006,
    InvalidArgument = -1007,
    Dns = -1008,
    Ssl = -1009,
    Http = -1010,
    Ws = -1011,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Eof => "end of stream",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Io => "I/O error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Busy => "resource busy",
            ErrorKind::Closed => "resource closed",
            ErrorKind::BadResource => "bad resource",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Dns => "name resolution failed",
            ErrorKind::Ssl => "TLS failure",
            ErrorKind::Http => "HTTP failure",
            ErrorKind::Ws => "WebSocket protocol failure",
        };
        f.write_str(s)
    }
}

/// A `{code, message}` pair, per spec §6.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Error {
        Error {
            kind,
            message: None,
        }
    }

    pub fn eof() -> Error {
        Error::from_kind(ErrorKind::Eof)
    }

    pub fn timeout() -> Error {
        Error::from_kind(ErrorKind::Timeout)
    }

    pub fn cancelled() -> Error {
        Error::new(ErrorKind::Cancelled, "operation was cancelled")
    }

    pub fn busy() -> Error {
        Error::new(ErrorKind::Busy, "resource already has a pending operation")
    }

    pub fn closed() -> Error {
        Error::new(ErrorKind::Closed, "resource is closed")
    }

    pub fn bad_resource() -> Error {
        Error::new(ErrorKind::BadResource, "resource is invalid or destroyed")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::Eof
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{} ({}): {}", self.kind, self.kind.code(), m),
            None => write!(f, "{} ({})", self.kind, self.kind.code()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::eof(),
            io::ErrorKind::TimedOut => Error::timeout(),
            io::ErrorKind::WouldBlock => Error::new(ErrorKind::Io, "operation would block"),
            _ => Error::new(ErrorKind::Io, err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
