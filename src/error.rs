//! Error types and handling for the flowlet runtime
//!
//! Every component reports failures through [`Error`], which names the component and wraps an
//! [`ErrorKind`] describing what went wrong. The kind decides how the dispatch driver reacts:
//! configuration errors abort startup, everything else is a per-delivery failure that goes
//! through the retry budget and, once that is exhausted, the failure policy.

use thiserror::Error;

use crate::process::FailureType;

/// The main Result type used throughout the flowlet runtime
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at startup: no input found, bad batch size, unresolvable schema or output.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transient transaction conflict detected at commit.
    #[error("Conflict error: {0}")]
    ConflictError(String),

    /// Failure reported by user processing code.
    #[error("User Defined error: {0}")]
    UserDefinedError(String),

    /// Payload could not be encoded or decoded, e.g. unknown source schema.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Storage, transaction system or other infrastructure failure.
    #[error("Internal error: {0}")]
    InternalError(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Topology - {0}")]
    TopologyError(ErrorKind),

    #[error("Consumer - {0}")]
    ConsumerError(ErrorKind),

    #[error("Emitter - {0}")]
    EmitterError(ErrorKind),

    #[error("Transaction - {0}")]
    TransactionError(ErrorKind),

    #[error("Driver - {0}")]
    DriverError(ErrorKind),

    #[error("Runtime - {0}")]
    RuntimeError(ErrorKind),

    #[error("Flowlet - {0}")]
    DefaultError(ErrorKind),
}

impl Error {
    /// Failure raised by flowlet code.
    pub fn user(message: impl Into<String>) -> Self {
        Error::DefaultError(ErrorKind::UserDefinedError(message.into()))
    }

    /// The kind of failure, independent of the component that raised it.
    pub fn kind(&self) -> &ErrorKind {
        match self {
            Error::TopologyError(kind)
            | Error::ConsumerError(kind)
            | Error::EmitterError(kind)
            | Error::TransactionError(kind)
            | Error::DriverError(kind)
            | Error::RuntimeError(kind)
            | Error::DefaultError(kind) => kind,
        }
    }

    /// Configuration errors are fatal: the flowlet instance cannot run.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConfigError(_))
    }

    /// Whether the error is a transaction conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConflictError(_))
    }

    /// Maps the error onto the failure type handed to failure callbacks.
    pub fn failure_type(&self) -> FailureType {
        match self.kind() {
            ErrorKind::UserDefinedError(_) => FailureType::UserException,
            ErrorKind::ConflictError(_) => FailureType::TransactionConflict,
            ErrorKind::SerializationError(_) => FailureType::Serialization,
            ErrorKind::ConfigError(_) | ErrorKind::InternalError(_) => FailureType::Infrastructure,
        }
    }

    /// The plain message without the component and kind prefixes.
    pub fn message(&self) -> &str {
        match self.kind() {
            ErrorKind::ConfigError(msg)
            | ErrorKind::ConflictError(msg)
            | ErrorKind::UserDefinedError(msg)
            | ErrorKind::SerializationError(msg)
            | ErrorKind::InternalError(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::DefaultError(ErrorKind::SerializationError(value.to_string()))
    }
}
