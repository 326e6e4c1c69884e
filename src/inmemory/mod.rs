//! In-memory implementations of the external collaborators.
//!
//! These back the unit tests and let a flow run embedded in a single process.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing is persisted
//! - **Single-process only**: queues, streams and transactions are not shared across processes
//! - **Non-blocking dequeue**: dequeue timeouts are accepted but ignored

mod coordinator;
mod dataset;
mod metrics;
mod queue;
mod transaction;

use std::sync::PoisonError;

use crate::error::Error;
use crate::shared::{ComponentError, Runtime};

pub use coordinator::InMemoryStreamCoordinator;
pub use dataset::InMemoryTable;
pub use metrics::InMemoryMetrics;
pub use queue::InMemoryQueueService;
pub use transaction::InMemoryTransactionSystem;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Runtime::internal_error("in-memory state lock poisoned")
}
