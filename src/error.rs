//! Dispatch error types
//!
//! Every failure that can reach a caller is a [`DispatchError`]. Errors are
//! plain data: they are cloned across worker channels and serialized over
//! the process wire without losing their kind.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code reported by the native engine after a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeErrorCode {
    Unknown,
    File,
    Format,
    Password,
    Security,
    Page,
    XfaLoad,
    XfaLayout,
    Other(u32),
}

impl NativeErrorCode {
    /// Map a raw last-error value to a code
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Unknown,
            2 => Self::File,
            3 => Self::Format,
            4 => Self::Password,
            5 => Self::Security,
            6 => Self::Page,
            7 => Self::XfaLoad,
            8 => Self::XfaLayout,
            other => Self::Other(other),
        }
    }

    /// Raw last-error value
    pub fn as_raw(&self) -> u32 {
        match self {
            Self::Unknown => 1,
            Self::File => 2,
            Self::Format => 3,
            Self::Password => 4,
            Self::Security => 5,
            Self::Page => 6,
            Self::XfaLoad => 7,
            Self::XfaLayout => 8,
            Self::Other(raw) => *raw,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::File => "unable to read file",
            Self::Format => "incorrect format",
            Self::Password => "invalid password",
            Self::Security => "invalid encryption",
            Self::Page => "incorrect page",
            Self::XfaLoad => "load XFA error",
            Self::XfaLayout => "layout XFA error",
            Self::Other(_) => "unexpected error",
        }
    }
}

impl fmt::Display for NativeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_raw(), self.description())
    }
}

/// Unified dispatch error type
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DispatchError {
    /// Reference is unknown, destroyed, of the wrong kind or from another scope
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Operation not supported by the engine, subtype or transport
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Engine reported a last-error code
    #[error("Native call {operation} failed: {code}")]
    NativeCallFailed {
        operation: String,
        code: NativeErrorCode,
    },

    /// Deadline expired at the dispatcher
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// No worker capacity left
    #[error("Worker pool exhausted: {0}")]
    PoolExhausted(String),

    /// Worker died from an earlier fatal condition
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Illegal progressive render transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Writing an output target failed
    #[error("IO error: {0}")]
    Io(String),
}

/// Coarse classification of a [`DispatchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidReference,
    UnsupportedOperation,
    NativeCallFailed,
    Timeout,
    PoolExhausted,
    WorkerUnavailable,
    InvalidState,
    InvalidRequest,
    Io,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference(_) => ErrorKind::InvalidReference,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::NativeCallFailed { .. } => ErrorKind::NativeCallFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Self::WorkerUnavailable(_) => ErrorKind::WorkerUnavailable,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// The reference used by the request no longer exists
    pub fn is_reference_gone(&self) -> bool {
        self.kind() == ErrorKind::InvalidReference
    }

    /// The operation failed because of the document content or its inputs
    pub fn is_content_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NativeCallFailed
                | ErrorKind::UnsupportedOperation
                | ErrorKind::InvalidState
                | ErrorKind::InvalidRequest
                | ErrorKind::Io
        )
    }

    /// The engine is temporarily (or permanently) unable to serve the call
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::PoolExhausted | ErrorKind::WorkerUnavailable
        )
    }

    /// Native error code, when the engine reported one
    pub fn native_code(&self) -> Option<NativeErrorCode> {
        match self {
            Self::NativeCallFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Io(err.to_string())
    }
}

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
