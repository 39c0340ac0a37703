//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `BrokerController`, `LockManager`, `OperationPoller`,
//!   `OperationWatcher`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the broker's fan-out listener (forwards to `SubscriberSet`).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
