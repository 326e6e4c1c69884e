//! Shared traits for consistent error construction across the runtime layers
//!

use crate::error::{Error, ErrorKind};

/// Trait for consistent error construction across all runtime components
///
/// Each layer has a marker type implementing [`ComponentError::wrap`]; the provided methods
/// build the matching [`ErrorKind`] so call sites read `Topology::config_error(..)`.
pub(crate) trait ComponentError {
    /// Wrap the kind into the component's error variant
    fn wrap(kind: ErrorKind) -> Error;

    /// Create a fatal configuration error
    fn config_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::ConfigError(message.into()))
    }

    /// Create a transaction conflict error
    fn conflict_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::ConflictError(message.into()))
    }

    /// Create a user-defined function error
    fn user_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::UserDefinedError(message.into()))
    }

    /// Create a serialization error
    fn serialization_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::SerializationError(message.into()))
    }

    /// Create an internal error
    fn internal_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::InternalError(message.into()))
    }
}

pub(crate) struct Topology;
pub(crate) struct Consumer;
pub(crate) struct Emitter;
pub(crate) struct Transactions;
pub(crate) struct Driver;
pub(crate) struct Runtime;

impl ComponentError for Topology {
    fn wrap(kind: ErrorKind) -> Error {
        Error::TopologyError(kind)
    }
}

impl ComponentError for Consumer {
    fn wrap(kind: ErrorKind) -> Error {
        Error::ConsumerError(kind)
    }
}

impl ComponentError for Emitter {
    fn wrap(kind: ErrorKind) -> Error {
        Error::EmitterError(kind)
    }
}

impl ComponentError for Transactions {
    fn wrap(kind: ErrorKind) -> Error {
        Error::TransactionError(kind)
    }
}

impl ComponentError for Driver {
    fn wrap(kind: ErrorKind) -> Error {
        Error::DriverError(kind)
    }
}

impl ComponentError for Runtime {
    fn wrap(kind: ErrorKind) -> Error {
        Error::RuntimeError(kind)
    }
}
