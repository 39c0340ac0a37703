//! Operation reconciliation: synchronous waits and background pollers.
//!
//! ## Contents
//! - [`OperationPoller`] blocks a request until a resource leaves its start state
//! - [`OperationWatcher`] watches in-progress resources and drives background pollers
//! - [`PollerRegistry`] injected per-name registry shared across watch restarts
//! - [`OperationSource`] external long-running operation feed (trait)

mod operation;
mod registry;
mod watcher;

pub use operation::{error_from_payload, OperationOutcome, OperationPoller};
pub use registry::PollerRegistry;
pub use watcher::{ExternalStatus, OperationSource, OperationWatcher};
