//! # Protocol controller.
//!
//! Implements the lifecycle verbs (provision, update, deprovision, bind,
//! unbind, last-operation) on top of the store client, the operation poller
//! and the lock manager.
//!
//! ## Contents
//! - [`BrokerController`] the verb state machine, one type for every deployment flavour
//! - [`Catalog`] / [`Plan`] read-only plan lookup, [`StaticCatalog`] in-memory impl
//! - [`OperationToken`] opaque token returned with `202 Accepted`
//! - request and [`BrokerResponse`] types exchanged with the HTTP layer
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use brokervisor::{
//!     BrokerConfig, BrokerController, LockManager, MemoryBackend, MemoryLockBackend,
//!     Plan, ResourceClient, StaticCatalog,
//! };
//! use brokervisor::events::Bus;
//!
//! let cfg = BrokerConfig::default();
//! let bus = Bus::new(cfg.bus_capacity_clamped());
//! let client = ResourceClient::new(Arc::new(MemoryBackend::default()), &cfg);
//! let locks = LockManager::new(Arc::new(MemoryLockBackend::new()), &cfg, bus.clone());
//! let catalog = Arc::new(StaticCatalog::new([Plan::new("small", "small")]));
//!
//! let controller = BrokerController::new(client, locks, catalog, &cfg, bus);
//! assert!(controller.check_api_version(Some("2.14")).is_ok());
//! ```

mod catalog;
mod core;
mod request;
mod response;
mod token;

pub use self::core::{
    BrokerController, BINDING_KIND, INSTANCE_KIND, OSB_GROUP, SERIAL_SERVICE_FLOW_KIND,
    SERVICE_FLOW_GROUP,
};
pub use catalog::{Catalog, Plan, StaticCatalog};
pub use request::{
    BindRequest, DeprovisionRequest, LastOperationRequest, ProvisionRequest, ServiceFlowRef,
    UnbindRequest, UpdateRequest,
};
pub use response::BrokerResponse;
pub use token::{decode_base64_json, OperationToken, OperationType};
