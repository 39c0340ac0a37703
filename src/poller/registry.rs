//! # Poller registry: one background poller per resource.
//!
//! The registry is an injected object, owned by whoever starts the watcher.
//! It outlives individual watch subscriptions, so re-establishing a watch
//! never drops or duplicates in-flight pollers.
//!
//! ## Architecture
//! ```text
//! OperationWatcher ── event(resource in_progress) ──► spawn_if_absent(group/kind/ns/id)
//!                                                      ├─ name present → ignored
//!                                                      └─ absent → child token + spawn + insert
//! poller task ── terminal state ──► remove(name)
//! shutdown ──► cancel_all(grace) → cancel tokens → join → stuck names
//! ```
//!
//! ## Rules
//! - The check and the insert happen under one write lock (single writer per name).
//! - Each poller gets a child of the registry's runtime token.
//! - A finished entry that was never removed is replaced on the next spawn.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};

struct Handle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Concurrency-safe set of running pollers.
///
/// Keys are opaque; the watcher uses the fully qualified resource address.
pub struct PollerRegistry {
    pollers: RwLock<HashMap<String, Handle>>,
    bus: Bus,
    runtime_token: CancellationToken,
}

impl PollerRegistry {
    pub fn new(bus: Bus, runtime_token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            pollers: RwLock::new(HashMap::new()),
            bus,
            runtime_token,
        })
    }

    /// Starts `make(token)` for `name` unless a live poller already exists.
    ///
    /// Returns `true` if a poller was spawned.
    pub async fn spawn_if_absent<F, Fut>(&self, name: &str, make: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pollers = self.pollers.write().await;
        if pollers.get(name).is_some_and(|h| !h.join.is_finished()) {
            return false;
        }

        let token = self.runtime_token.child_token();
        let join = tokio::spawn(make(token.clone()));
        pollers.insert(
            name.to_string(),
            Handle {
                join,
                cancel: token,
            },
        );
        drop(pollers);

        self.bus
            .publish(Event::new(EventKind::PollerStarted).with_resource(name));
        true
    }

    /// Forgets `name` without joining; called by a poller as it exits.
    pub async fn remove(&self, name: &str) {
        self.pollers.write().await.remove(name);
    }

    /// Cancels the poller for `name`, if any, and waits for it.
    pub async fn cancel(&self, name: &str) -> bool {
        let handle = self.pollers.write().await.remove(name);
        match handle {
            Some(h) => {
                h.cancel.cancel();
                let _ = h.join.await;
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.pollers.read().await.contains_key(name)
    }

    /// Sorted names of registered pollers.
    pub async fn list(&self) -> Vec<String> {
        let pollers = self.pollers.read().await;
        let mut names: Vec<String> = pollers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub async fn len(&self) -> usize {
        self.pollers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pollers.read().await.is_empty()
    }

    /// Cancels every poller and waits up to `grace` for all of them.
    ///
    /// Returns the names still running when the grace period ran out.
    pub async fn cancel_all(&self, grace: Duration) -> Vec<String> {
        let handles: Vec<(String, Handle)> = {
            let mut pollers = self.pollers.write().await;
            pollers.drain().collect()
        };

        for (_, h) in &handles {
            h.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut stuck = Vec::new();
        for (name, h) in handles {
            if tokio::time::timeout_at(deadline, h.join).await.is_err() {
                stuck.push(name);
            }
        }
        stuck.sort_unstable();
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_duplicate_spawn_is_ignored() {
        let reg = PollerRegistry::new(Bus::new(16), CancellationToken::new());
        let starts = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let s = Arc::clone(&starts);
            reg.spawn_if_absent("i1", move |token| async move {
                s.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
            })
            .await;
        }
        tokio::task::yield_now().await;
        assert_eq!(reg.list().await, vec!["i1".to_string()]);

        assert!(reg.cancel_all(Duration::from_secs(1)).await.is_empty());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_finished_entry_is_replaced() {
        let reg = PollerRegistry::new(Bus::new(16), CancellationToken::new());
        assert!(reg.spawn_if_absent("i1", |_| async {}).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reg.spawn_if_absent("i1", |_| async {}).await);
    }

    #[tokio::test]
    async fn test_cancel_all_reports_stuck() {
        let reg = PollerRegistry::new(Bus::new(16), CancellationToken::new());
        reg.spawn_if_absent("wedged", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;
        reg.spawn_if_absent("polite", |token| async move { token.cancelled().await })
            .await;

        let stuck = reg.cancel_all(Duration::from_millis(50)).await;
        assert_eq!(stuck, vec!["wedged".to_string()]);
    }
}
