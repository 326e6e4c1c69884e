//! A transactional execution engine for flowlets, the processing nodes of a streaming flow.
//!
//! A flow is a graph of flowlets connected by queues, fed by external streams. Every running
//! instance of a flowlet repeatedly dequeues a batch from one of its inputs, hands it to the
//! matching process method and commits the consumption, the emitted events and the dataset
//! writes in a single transaction. Failed invocations are retried against the same input until
//! the retry budget runs out, then the [failure policy] decides whether to keep retrying or to
//! skip the input.
//!
//! The storage, transaction and stream coordination services are external and reached through
//! traits ([`queue::QueueClientFactory`], [`transaction::TransactionSystemClient`],
//! [`queue::StreamCoordinatorClient`]). The [`inmemory`] module implements all of them for tests
//! and embedded use.
//!
//! [failure policy]: process::FailurePolicy

/// identifiers, configuration and shutdown handling
mod shared;

/// errors raised by the runtime, classified by component and kind
pub mod error;

/// schemas of the events exchanged between flowlets and their compatibility rules
pub mod schema;

/// flow topology and the queue specifications derived from it
pub mod flow;

/// transactions spanning queues, streams and datasets
pub mod transaction;

/// metrics emitted by running instances
pub mod metrics;

/// queue and stream storage interfaces and the suppliers owning their handles
pub mod queue;

/// input readers of process methods
pub mod reader;

/// typed output emitters
pub mod emitter;

/// flowlets, their process and tick methods
pub mod process;

/// the dispatch loop of a flowlet instance
pub mod driver;

/// lifecycle of a running instance and its controller
pub mod runtime;

/// assembly of a flowlet instance from a flow
pub mod runner;

/// in-memory storage, transaction and coordination services
pub mod inmemory;

pub use error::{Error, ErrorKind, Result};
pub use shared::{
    FlowletId, Node, NodeType, QueueName, RuntimeConfig, StreamId, ANY_INPUT, DEFAULT_NAMESPACE,
};
