//! Error types for legacy-style operations.

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// All errors that can occur while talking to the server through the legacy surface.
#[derive(Debug, Clone, Error)]
pub enum MgoError {
    /// A lookup legitimately found nothing.
    #[error("not found")]
    NotFound,

    /// Network or server failure reported by the driver, passed through unchanged.
    #[error(transparent)]
    Transport(#[from] mongodb::error::Error),

    /// The per-call deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Source document could not be decoded into the destination.
    #[error("decode error: {0}")]
    Decode(String),

    /// One or more operations of a bulk batch failed.
    #[error(transparent)]
    Bulk(BulkError),

    /// Structured server error with a code and message.
    #[error(transparent)]
    Query(QueryError),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Read or write on a file that was already closed.
    #[error("file is closed")]
    FileClosed,
}

impl MgoError {
    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        MgoError::Decode(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MgoError::InvalidArgument(msg.into())
    }

    /// Check if this is the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MgoError::NotFound)
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MgoError::Timeout)
    }

    /// Get the server error code if available.
    pub fn code(&self) -> Option<i32> {
        match self {
            MgoError::Query(e) => Some(e.code),
            MgoError::Bulk(e) if e.cases.len() == 1 => Some(e.cases[0].err.code),
            MgoError::Transport(e) => {
                use mongodb::error::{ErrorKind as Kind, WriteFailure};
                match e.kind.as_ref() {
                    Kind::Command(cmd) => Some(cmd.code),
                    Kind::Write(WriteFailure::WriteError(w)) => Some(w.code),
                    Kind::Write(WriteFailure::WriteConcernError(w)) => Some(w.code),
                    Kind::InsertMany(m) => m
                        .write_errors
                        .as_ref()
                        .and_then(|errs| errs.first())
                        .map(|w| w.code)
                        .or_else(|| m.write_concern_error.as_ref().map(|w| w.code)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl From<bson::ser::Error> for MgoError {
    fn from(err: bson::ser::Error) -> Self {
        MgoError::Decode(err.to_string())
    }
}

impl From<bson::de::Error> for MgoError {
    fn from(err: bson::de::Error) -> Self {
        MgoError::Decode(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MgoError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MgoError::Timeout
    }
}

/// Result type alias for legacy-style operations.
pub type Result<T> = std::result::Result<T, MgoError>;

/// Error kind enumeration for pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing matched.
    NotFound,
    /// Driver or server failure.
    Transport,
    /// Timeout error.
    Timeout,
    /// Decode error.
    Decode,
    /// Write error from a bulk batch.
    Bulk,
    /// Structured server error.
    Query,
    /// Caller error.
    InvalidArgument,
}

impl MgoError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MgoError::NotFound => ErrorKind::NotFound,
            MgoError::Transport(_) => ErrorKind::Transport,
            MgoError::Timeout => ErrorKind::Timeout,
            MgoError::Decode(_) => ErrorKind::Decode,
            MgoError::Bulk(_) => ErrorKind::Bulk,
            MgoError::Query(_) => ErrorKind::Query,
            MgoError::InvalidArgument(_) | MgoError::FileClosed => ErrorKind::InvalidArgument,
        }
    }
}

/// Code and message pair as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryError {
    pub code: i32,
    pub message: String,
    pub assertion: bool,
}

impl QueryError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            assertion: false,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code != 0 {
            write!(f, "{} (code {})", self.message, self.code)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for QueryError {}

/// A failed operation inside a bulk batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkErrorCase {
    /// Position of the operation in the batch, `-1` when no single operation applies.
    pub index: i64,
    pub err: QueryError,
}

/// Aggregate of the failures of one bulk run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkError {
    pub(crate) cases: Vec<BulkErrorCase>,
}

impl BulkError {
    pub fn new(cases: Vec<BulkErrorCase>) -> Self {
        Self { cases }
    }

    /// The individual error cases.
    pub fn cases(&self) -> &[BulkErrorCase] {
        &self.cases
    }
}

impl fmt::Display for BulkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cases.as_slice() {
            [] => f.write_str("invalid BulkError instance: no errors"),
            [single] => write!(f, "{}", single.err),
            cases => {
                f.write_str("multiple errors in bulk operation:\n")?;
                let mut seen = HashSet::with_capacity(cases.len());
                for case in cases {
                    let msg = case.err.to_string();
                    if seen.insert(msg.clone()) {
                        writeln!(f, "  - {msg}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for BulkError {}
