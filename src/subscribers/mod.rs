//! # Event subscribers for the broker runtime.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out,
//! and the built-in [`LogWriter`] (feature `logging`).
//!
//! ## Architecture
//! ```text
//! Controller / LockManager / pollers ── publish(Event) ──► Bus
//!                                                           │
//!                                            fan-out listener (Broker)
//!                                                           │
//!                                                     SubscriberSet
//!                                               ┌───────────┼───────────┐
//!                                               ▼           ▼           ▼
//!                                           LogWriter     Audit      Custom
//! ```

#[cfg(feature = "logging")]
mod log;
mod set;
mod subscriber;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
