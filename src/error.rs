//! Error taxonomy shared by every scanner operation
//!
//! Synchronous operations return [`ScanError`] inline, background operations
//! deliver it through their completion. The [`ErrorKind`] is what callers
//! branch on; the detail string is for logs.

use std::fmt;

/// Result type for scanner operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Kind of failure, with the stable numeric codes used by the SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Invalid call sequence, e.g. reconfiguring the proxy while open
    Misuse,
    /// Access permission denied
    NoPerm,
    /// File not found
    NoFile,
    /// Store locked by another process or context
    Busy,
    /// Store file damaged
    Corrupt,
    /// Operation requires a non-empty store
    Empty,
    /// Authorization denied
    Auth,
    /// No internet connection
    NoConn,
    /// Operation timeout
    Timeout,
    /// Threading precondition violated
    Thread,
    /// Credentials do not match the signature set
    CredMismatch,
    /// Internet connection too slow
    SlowConn,
    /// Record not found
    NoRec,
    /// Operation cancelled
    Abort,
    /// Resource temporarily unavailable
    Unavail,
    /// Image size or format not supported
    Img,
    /// Wrong API key
    ApiKey,
    /// Wrong API secret
    ApiSecret,
    /// A network problem occurred
    NetworkFail,
    /// Store is not open
    NotOpen,
    /// Bundle could not be read
    Bundle,
}

impl ErrorKind {
    /// Every kind, in code order
    pub const ALL: [ErrorKind; 21] = [
        ErrorKind::Misuse,
        ErrorKind::NoPerm,
        ErrorKind::NoFile,
        ErrorKind::Busy,
        ErrorKind::Corrupt,
        ErrorKind::Empty,
        ErrorKind::Auth,
        ErrorKind::NoConn,
        ErrorKind::Timeout,
        ErrorKind::Thread,
        ErrorKind::CredMismatch,
        ErrorKind::SlowConn,
        ErrorKind::NoRec,
        ErrorKind::Abort,
        ErrorKind::Unavail,
        ErrorKind::Img,
        ErrorKind::ApiKey,
        ErrorKind::NetworkFail,
        ErrorKind::NotOpen,
        ErrorKind::Bundle,
        ErrorKind::ApiSecret,
    ];

    /// Stable numeric code
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Misuse => 2,
            ErrorKind::NoPerm => 3,
            ErrorKind::NoFile => 4,
            ErrorKind::Busy => 5,
            ErrorKind::Corrupt => 6,
            ErrorKind::Empty => 7,
            ErrorKind::Auth => 8,
            ErrorKind::NoConn => 9,
            ErrorKind::Timeout => 10,
            ErrorKind::Thread => 11,
            ErrorKind::CredMismatch => 12,
            ErrorKind::SlowConn => 13,
            ErrorKind::NoRec => 14,
            ErrorKind::Abort => 15,
            ErrorKind::Unavail => 16,
            ErrorKind::Img => 17,
            ErrorKind::ApiKey => 18,
            ErrorKind::NetworkFail => 19,
            ErrorKind::NotOpen => 20,
            ErrorKind::Bundle => 21,
            ErrorKind::ApiSecret => 22,
        }
    }

    /// Look a kind up by its numeric code
    pub fn from_code(code: i32) -> Option<ErrorKind> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// User-facing message
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::Misuse => "invalid use of the library",
            ErrorKind::NoPerm => "access permission denied",
            ErrorKind::NoFile => "file not found",
            ErrorKind::Busy => "database file locked",
            ErrorKind::Corrupt => "database file corrupted",
            ErrorKind::Empty => "empty database",
            ErrorKind::Auth => "authorization denied",
            ErrorKind::NoConn => "no internet connection",
            ErrorKind::Timeout => "operation timeout",
            ErrorKind::Thread => "threading error",
            ErrorKind::CredMismatch => "credentials mismatch",
            ErrorKind::SlowConn => "internet connection too slow",
            ErrorKind::NoRec => "record not found",
            ErrorKind::Abort => "operation aborted",
            ErrorKind::Unavail => "resource temporarily unavailable",
            ErrorKind::Img => "image size or format not supported",
            ErrorKind::ApiKey => "wrong API key or no offline image",
            ErrorKind::NetworkFail => "a network problem occurred",
            ErrorKind::NotOpen => "scanner is not open",
            ErrorKind::Bundle => "could not read bundle",
            ErrorKind::ApiSecret => "wrong API secret",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A scanner failure: a kind plus a free-form detail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ScanError {
    kind: ErrorKind,
    detail: String,
}

impl ScanError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse, detail)
    }

    pub fn not_open() -> Self {
        Self::new(ErrorKind::NotOpen, "the signature store is closed")
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Abort, "operation cancelled")
    }

    pub fn bundle(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bundle, detail)
    }

    pub fn img(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Img, detail)
    }

    /// Whether this error reports a cancellation rather than a failure
    pub fn is_abort(&self) -> bool {
        self.kind == ErrorKind::Abort
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let kind = match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => ErrorKind::Busy,
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => ErrorKind::Corrupt,
            Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => ErrorKind::NoPerm,
            Some(ErrorCode::CannotOpen) => ErrorKind::NoFile,
            Some(ErrorCode::OperationInterrupted) => ErrorKind::Abort,
            Some(ErrorCode::DiskFull) | Some(ErrorCode::OutOfMemory) => ErrorKind::Unavail,
            _ => match err {
                rusqlite::Error::QueryReturnedNoRows => ErrorKind::NoRec,
                _ => ErrorKind::Corrupt,
            },
        };
        Self::new(kind, err.to_string())
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match err.kind() {
            Io::NotFound => ErrorKind::NoFile,
            Io::PermissionDenied => ErrorKind::NoPerm,
            Io::WouldBlock => ErrorKind::Busy,
            Io::TimedOut => ErrorKind::Timeout,
            Io::Interrupted => ErrorKind::Abort,
            Io::InvalidData | Io::UnexpectedEof => ErrorKind::Corrupt,
            _ => ErrorKind::Unavail,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::NoConn
        } else {
            ErrorKind::NetworkFail
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::NetworkFail, format!("malformed response: {err}"))
    }
}

impl From<image::ImageError> for ScanError {
    fn from(err: image::ImageError) -> Self {
        Self::new(ErrorKind::Img, err.to_string())
    }
}
