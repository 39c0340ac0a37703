//! Lock backend boundary: a named mutex with a lease, plus a small key/value
//! space for the lock details sub-resource.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::BackendError;

/// Token identifying one acquisition of a backend mutex.
pub type LeaseId = u64;

#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Takes the mutex `name` for at most `ttl`.
    ///
    /// Fails with code 409 while another unexpired lease holds it.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<LeaseId, BackendError>;

    /// Releases the mutex if `lease` still holds it; otherwise a no-op.
    async fn release(&self, name: &str, lease: LeaseId) -> Result<(), BackendError>;

    /// Reads a value; expired or missing keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Writes a value with an optional expiry.
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BackendError>;
}
