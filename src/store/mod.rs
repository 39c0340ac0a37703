//! Resource store: typed client over a namespaced, labeled, versioned object API.
//!
//! ## Contents
//! - [`ResourceClient`] stateless façade used by every other layer
//! - [`ResourceBackend`] the consumed object API (trait), [`MemoryBackend`] reference impl
//! - [`LabelSelector`] selector grammar shared by list and watch
//! - [`Resource`], [`ResourceRef`], [`ResourceState`] the resource model
//!
//! ```text
//! controller / lock / pollers
//!            │
//!            ▼
//!     ResourceClient ── encode/merge (codec) ──► ResourceBackend (K8s API, memory, ...)
//!            ▲                                          │
//!            └────── BrokerError::from_status ◄── BackendError{code}
//! ```

mod backend;
mod client;
pub mod codec;
mod memory;
mod resource;
mod selector;

pub use backend::{BackendError, RawWatchEvent, RawWatchStream, ResourceBackend, WatchEventKind};
pub use client::{
    last_operation_label, NewResource, ResourceClient, ResourceEvent, ResourcePatch,
    ResourceWatch, StatusView, NAMESPACE_PREFIX,
};
pub use memory::MemoryBackend;
pub use resource::{
    ObjectKey, ObjectMeta, RawObject, Resource, ResourceRef, ResourceState, INSTANCE_LABEL,
    STATE_LABEL,
};
pub use selector::{LabelSelector, Requirement};
