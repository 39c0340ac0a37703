//! # brokervisor
//!
//! **Brokervisor** is a service broker control plane. It answers the
//! provisioning protocol (provision / update / deprovision / bind / unbind /
//! last-operation) by creating and mutating declarative resources in a
//! Kubernetes-style object store, then observing them until an operator
//! drives them to a terminal state.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!              lifecycle request (HTTP layer, not part of this crate)
//!                                   │
//!                                   ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  BrokerController (verb state machine, Capabilities-selected)     │
//! │  - Catalog (plan lookup)                                          │
//! │  - OperationToken (opaque async token)                            │
//! └──────┬──────────────────────┬─────────────────────────┬───────────┘
//!        │ lock / unlock        │ create / patch / get    │ await_terminal
//!        ▼                      ▼                         ▼
//! ┌──────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │ LockManager  │   │   ResourceClient    │◄──│   OperationPoller   │
//! │ <id>/lock    │   │ codec, namespaces,  │   │ poll until state ≠  │
//! │ <id>/lock/   │   │ label sync, retries │   │ start or timeout    │
//! │   details    │   └──────────┬──────────┘   └─────────────────────┘
//! └──────┬───────┘              │                         ▲
//!        ▼                      ▼                         │ watch(state in (in_progress))
//!   LockBackend          ResourceBackend ◄──────── OperationWatcher ──► OperationSource
//!   (trait)              (trait)                   + PollerRegistry      (external ops)
//! ```
//!
//! ### Resource lifecycle
//! ```text
//! in_queue ──► in_progress ──► succeeded | failed
//! update   ──► succeeded | failed
//! delete   ──► (object removed) | delete_failed
//! ```
//! `in_queue`, `in_progress`, `update` and `delete` read as `in progress` to
//! last-operation callers.
//!
//! ### Events
//! ```text
//! controller / locks / pollers ── publish ──► Bus ──► listener ──► SubscriberSet ──► LogWriter, custom
//! ```
//!
//! ## Features
//! | Area              | Description                                                      | Key types / traits                          |
//! |-------------------|------------------------------------------------------------------|---------------------------------------------|
//! | **Controller**    | Lifecycle verbs, conflict/gone semantics, service flows.         | [`BrokerController`], [`Catalog`]           |
//! | **Store**         | Typed CRUD/list/watch over a versioned object API.               | [`ResourceClient`], [`ResourceBackend`]     |
//! | **Locks**         | Per-instance advisory WRITE locks.                               | [`LockManager`], [`LockBackend`]            |
//! | **Reconciliation**| Synchronous waits and background pollers.                        | [`OperationPoller`], [`OperationWatcher`]   |
//! | **Subscriber API**| Hook into lifecycle events (logging, audit, metrics).            | [`Subscribe`]                               |
//! | **Errors**        | One taxonomy mapped from backend status codes.                   | [`BrokerError`], [`RuntimeError`]           |
//! | **Configuration** | Centralized settings and capability selection.                   | [`BrokerConfig`], [`Capabilities`]          |
//!
//! ## Optional features
//! - `logging` (default): exports the built-in [`LogWriter`] rendering events through `tracing`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use brokervisor::{Broker, BrokerConfig, Plan, ProvisionRequest, StaticCatalog};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = StaticCatalog::new([Plan::new("small", "small").asynchronous(true)]);
//!
//!     #[cfg(feature = "logging")]
//!     let subs: Vec<Arc<dyn brokervisor::Subscribe>> = vec![Arc::new(brokervisor::LogWriter::new())];
//!     #[cfg(not(feature = "logging"))]
//!     let subs: Vec<Arc<dyn brokervisor::Subscribe>> = Vec::new();
//!
//!     let broker = Broker::builder(BrokerConfig::default())
//!         .with_catalog(Arc::new(catalog))
//!         .with_subscribers(subs)
//!         .build();
//!
//!     let res = broker.controller().provision(ProvisionRequest::new("i1", "small")).await?;
//!     assert_eq!(res.status, 202);
//!     assert!(res.operation().is_some());
//!     Ok(())
//! }
//! ```
mod config;
mod controller;
mod error;
pub mod events;
mod lock;
mod policies;
mod poller;
mod runtime;
pub mod store;
mod subscribers;

// ---- Public re-exports ----

pub use config::{Addressing, BrokerConfig, Capabilities, DashboardConfig, LockMode};
pub use controller::{
    decode_base64_json, BindRequest, BrokerController, BrokerResponse, Catalog,
    DeprovisionRequest, LastOperationRequest, OperationToken, OperationType, Plan,
    ProvisionRequest, ServiceFlowRef, StaticCatalog, UnbindRequest, UpdateRequest, BINDING_KIND,
    INSTANCE_KIND, OSB_GROUP, SERIAL_SERVICE_FLOW_KIND, SERVICE_FLOW_GROUP,
};
pub use error::{BrokerError, BrokerResult, RuntimeError};
pub use events::{Bus, Event, EventKind};
pub use lock::{
    details_key, mutex_key, LeaseId, LockBackend, LockDetails, LockManager, LockStatus,
    LockedResourceDetails, MemoryLockBackend, WRITE,
};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use poller::{
    error_from_payload, ExternalStatus, OperationOutcome, OperationPoller, OperationSource,
    OperationWatcher, PollerRegistry,
};
pub use runtime::{Broker, BrokerBuilder};
pub use store::{
    BackendError, LabelSelector, MemoryBackend, NewResource, Resource, ResourceBackend,
    ResourceClient, ResourcePatch, ResourceRef, ResourceState,
};
pub use subscribers::{Subscribe, SubscriberSet};

// Built-in tracing subscriber.
// Disable with: `--no-default-features`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
