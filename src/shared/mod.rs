//! Shared utilities and common functionality
//!
//! This module contains identifiers, configuration, constants and traits that are shared
//! across the different layers of the flowlet runtime.

mod config;
mod shutdown;
mod traits;
mod types;

pub use config::RuntimeConfig;
pub(crate) use shutdown::shutdown_signal;
pub(crate) use traits::*;
pub use types::*;
