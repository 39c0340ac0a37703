//! In-memory [`LockBackend`] with lease expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::lock::backend::{LeaseId, LockBackend};
use crate::store::BackendError;

#[derive(Default)]
struct Inner {
    next_lease: LeaseId,
    mutexes: HashMap<String, (LeaseId, Instant)>,
    values: HashMap<String, (Value, Option<Instant>)>,
}

/// Reference lock backend. Expiry is evaluated lazily against `tokio::time::Instant`.
#[derive(Default)]
pub struct MemoryLockBackend {
    inner: Mutex<Inner>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<LeaseId, BackendError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = inner.mutexes.get(name) {
            if *expires > now {
                return Err(BackendError::conflict(format!("mutex '{name}' is held")));
            }
        }
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.mutexes.insert(name.to_string(), (lease, now + ttl));
        Ok(lease)
    }

    async fn release(&self, name: &str, lease: LeaseId) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if inner.mutexes.get(name).is_some_and(|(held, _)| *held == lease) {
            inner.mutexes.remove(name);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner.values.get(key).and_then(|(v, expires)| match expires {
            Some(at) if *at <= now => None,
            _ => Some(v.clone()),
        }))
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BackendError> {
        let expires = ttl.map(|d| Instant::now() + d);
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_string(), (value, expires));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mutex_lease_expires() {
        let b = MemoryLockBackend::new();
        let lease = b.acquire("i1/lock", Duration::from_millis(30)).await.unwrap();
        assert_eq!(b.acquire("i1/lock", Duration::from_secs(1)).await.unwrap_err().code, 409);

        // Stale lease id does not release a newer holder.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let newer = b.acquire("i1/lock", Duration::from_secs(1)).await.unwrap();
        b.release("i1/lock", lease).await.unwrap();
        assert!(b.acquire("i1/lock", Duration::from_secs(1)).await.is_err());
        b.release("i1/lock", newer).await.unwrap();
        assert!(b.acquire("i1/lock", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_values_expire() {
        let b = MemoryLockBackend::new();
        b.put("k", json!({"count": 1}), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(b.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.get("k").await.unwrap().is_none());
    }
}
