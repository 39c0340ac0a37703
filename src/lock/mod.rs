//! Advisory locks keyed per service instance.
//!
//! ## Contents
//! - [`LockManager`] lock / unlock / status introspection
//! - [`LockBackend`] consumed mutex + key/value boundary, [`MemoryLockBackend`] reference impl

mod backend;
mod manager;
mod memory;

pub use backend::{LeaseId, LockBackend};
pub use manager::{
    details_key, mutex_key, LockDetails, LockManager, LockStatus, LockedResourceDetails, WRITE,
};
pub use memory::MemoryLockBackend;
