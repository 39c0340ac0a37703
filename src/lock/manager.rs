//! # Advisory per-instance write lock.
//!
//! [`LockManager`] serializes conflicting lifecycle operations on one
//! instance. A lock is a details document at `<name>/lock/details`:
//!
//! ```text
//! { "count": 1, "operationType": "WRITE", "lockTime": "...",
//!   "lockedResourceDetails": { "operation": "update", "requestedAt": "..." },
//!   "ttlSecs": 0 }
//! ```
//!
//! The check-then-act runs under the backend mutex `<name>/lock`, taken with a
//! short lease (`lock_acquire_ttl`). If the process dies between acquiring the
//! mutex and writing details, the mutex lease lapses and the name reads as
//! unlocked again. Details themselves carry the optional `lock_ttl` lease.
//!
//! ## Rules
//! - A second `lock` on a write-locked name fails with [`BrokerError::LockConflict`].
//! - `unlock` writes `{count: 0, operationType: ""}` and is idempotent.
//! - Callers release on every exit path of a lock-guarded operation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{Bus, Event, EventKind};
use crate::lock::backend::LockBackend;

/// `operationType` of an exclusive lock.
pub const WRITE: &str = "WRITE";

const CONFLICT_MESSAGE: &str = "Could not acquire lock";

/// Operation recorded as the lock holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedResourceDetails {
    pub operation: String,
    pub requested_at: DateTime<Utc>,
}

/// Content of `<name>/lock/details`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDetails {
    pub count: u32,
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_resource_details: Option<LockedResourceDetails>,
    #[serde(default)]
    pub ttl_secs: u64,
}

impl LockDetails {
    pub fn unlocked() -> Self {
        Self {
            count: 0,
            operation_type: String::new(),
            lock_time: None,
            locked_resource_details: None,
            ttl_secs: 0,
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.count == 1 && self.operation_type == WRITE
    }

    /// Operation holding the lock, if recorded.
    pub fn holder(&self) -> Option<&str> {
        self.locked_resource_details
            .as_ref()
            .map(|d| d.operation.as_str())
    }
}

/// Result of [`LockManager::check_write_lock_status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub is_write_locked: bool,
    pub details: Option<LockDetails>,
}

pub fn mutex_key(name: &str) -> String {
    format!("{name}/lock")
}

pub fn details_key(name: &str) -> String {
    format!("{name}/lock/details")
}

/// Lock manager over a [`LockBackend`].
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    bus: Bus,
    acquire_ttl: Duration,
    details_ttl: Option<Duration>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, cfg: &BrokerConfig, bus: Bus) -> Self {
        Self {
            backend,
            bus,
            acquire_ttl: cfg.lock_acquire_ttl,
            details_ttl: cfg.lock_ttl(),
        }
    }

    /// Takes the WRITE lock on `name` on behalf of `operation`.
    pub async fn lock(&self, name: &str, operation: &str) -> BrokerResult<LockDetails> {
        let mutex = mutex_key(name);
        let lease = match self.backend.acquire(&mutex, self.acquire_ttl).await {
            Ok(lease) => lease,
            Err(e) if e.code == 409 => {
                return Err(self.rejected(name, operation, CONFLICT_MESSAGE.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = self.record(name, operation).await;
        // Mutex release failure only delays the next locker until the lease lapses.
        if let Err(e) = self.backend.release(&mutex, lease).await {
            debug!(name, error = %e, "mutex release failed");
        }
        let details = outcome?;

        self.bus.publish(
            Event::new(EventKind::LockAcquired)
                .with_resource(name)
                .with_operation(operation),
        );
        Ok(details)
    }

    async fn record(&self, name: &str, operation: &str) -> BrokerResult<LockDetails> {
        if let Some(current) = self.details(name).await? {
            if current.is_write_locked() {
                let message = match current.holder() {
                    Some(holder) => format!("{CONFLICT_MESSAGE}: write locked for {holder}"),
                    None => CONFLICT_MESSAGE.to_string(),
                };
                return Err(self.rejected(name, operation, message));
            }
        }

        let now = Utc::now();
        let details = LockDetails {
            count: 1,
            operation_type: WRITE.to_string(),
            lock_time: Some(now),
            locked_resource_details: Some(LockedResourceDetails {
                operation: operation.to_string(),
                requested_at: now,
            }),
            ttl_secs: self.details_ttl.map_or(0, |d| d.as_secs()),
        };
        self.backend
            .put(&details_key(name), serde_json::to_value(&details)?, self.details_ttl)
            .await?;
        Ok(details)
    }

    fn rejected(&self, name: &str, operation: &str, message: String) -> BrokerError {
        self.bus.publish(
            Event::new(EventKind::LockRejected)
                .with_resource(name)
                .with_operation(operation)
                .with_reason(message.clone()),
        );
        BrokerError::LockConflict {
            name: name.to_string(),
            message,
        }
    }

    /// Clears the lock details. Unlocking a free name is a no-op.
    pub async fn unlock(&self, name: &str) -> BrokerResult<()> {
        let value = serde_json::to_value(LockDetails::unlocked())?;
        self.backend.put(&details_key(name), value, None).await?;
        self.bus
            .publish(Event::new(EventKind::LockReleased).with_resource(name));
        Ok(())
    }

    pub async fn is_write_locked(&self, name: &str) -> BrokerResult<bool> {
        Ok(self
            .details(name)
            .await?
            .is_some_and(|d| d.is_write_locked()))
    }

    pub async fn check_write_lock_status(&self, name: &str) -> BrokerResult<LockStatus> {
        let details = self.details(name).await?;
        Ok(LockStatus {
            is_write_locked: details.as_ref().is_some_and(LockDetails::is_write_locked),
            details,
        })
    }

    async fn details(&self, name: &str) -> BrokerResult<Option<LockDetails>> {
        match self.backend.get(&details_key(name)).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }
}
