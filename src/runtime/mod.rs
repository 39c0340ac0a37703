//! Broker runtime: construction, event fan-out and graceful shutdown.
//!
//! - [`Broker`] owns the bus, the controller and the background watchers
//! - [`BrokerBuilder`] wires backends, catalog, subscribers and watches

mod broker;
mod builder;
mod shutdown;

pub use broker::Broker;
pub use builder::BrokerBuilder;
