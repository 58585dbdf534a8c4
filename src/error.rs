//! Error types for the proxy engine
//!
//! Every fallible configuration or CA call returns [`Error`], which maps onto a
//! stable numeric [`StatusCode`] for hosts that only understand integers.

use std::io;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric status carried across the host boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    InvalidArgument = 1,
    InvalidState = 2,
    Io = 3,
    Ca = 4,
    Internal = 255,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Error taxonomy of the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied unusable input; nothing was changed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filesystem or socket failure
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Certificate or key material is invalid or could not be issued
    #[error("CA error: {0}")]
    Ca(String),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create a CA error and log it
    pub fn ca(msg: impl Into<String>) -> Self {
        let error = Error::Ca(msg.into());
        tracing::error!("{}", error);
        error
    }

    /// Create an internal error and log it
    pub fn internal(msg: impl Into<String>) -> Self {
        let error = Error::Internal(msg.into());
        tracing::error!("{}", error);
        error
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Numeric status for this error
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::InvalidState(_) => StatusCode::InvalidState,
            Error::Io { .. } => StatusCode::Io,
            Error::Ca(_) => StatusCode::Ca,
            Error::Internal(_) => StatusCode::Internal,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::io("I/O operation failed", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Ok.as_i32(), 0);
        assert_eq!(Error::invalid_argument("x").code().as_i32(), 1);
        assert_eq!(Error::invalid_state("x").code().as_i32(), 2);
        let io = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(Error::from(io).code().as_i32(), 3);
        assert_eq!(Error::Ca("x".into()).code().as_i32(), 4);
        assert_eq!(Error::Internal("x".into()).code().as_i32(), 255);
    }

    #[test]
    fn test_io_message_keeps_context() {
        let err = Error::io(
            "failed to read /tmp/ca.pem",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let text = err.to_string();
        assert!(text.contains("/tmp/ca.pem"));
        assert!(text.contains("no such file"));
    }
}
