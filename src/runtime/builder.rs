use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::controller::{BrokerController, Catalog, StaticCatalog};
use crate::events::Bus;
use crate::lock::{LockBackend, LockManager, MemoryLockBackend};
use crate::poller::{OperationSource, OperationWatcher, PollerRegistry};
use crate::store::{MemoryBackend, ResourceBackend, ResourceClient};
use crate::subscribers::{Subscribe, SubscriberSet};

use super::broker::Broker;

struct WatchSpec {
    source: Arc<dyn OperationSource>,
    group: String,
    kind: String,
}

/// Builder for a [`Broker`].
///
/// Unset backends default to the in-memory reference implementations and an
/// empty catalog.
pub struct BrokerBuilder {
    cfg: BrokerConfig,
    backend: Option<Arc<dyn ResourceBackend>>,
    lock_backend: Option<Arc<dyn LockBackend>>,
    catalog: Option<Arc<dyn Catalog>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    watches: Vec<WatchSpec>,
}

impl BrokerBuilder {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            backend: None,
            lock_backend: None,
            catalog: None,
            subscribers: Vec::new(),
            watches: Vec::new(),
        }
    }

    /// Resource store the broker reads and writes.
    pub fn with_backend(mut self, backend: Arc<dyn ResourceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Backend of the instance locks (used only in locked deployments).
    pub fn with_lock_backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets event subscribers.
    ///
    /// Each subscriber gets its own bounded queue and worker.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Reconciles in-progress `(group, kind)` resources against `source` in the background.
    pub fn with_watcher(
        mut self,
        source: Arc<dyn OperationSource>,
        group: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        self.watches.push(WatchSpec {
            source,
            group: group.into(),
            kind: kind.into(),
        });
        self
    }

    /// Wires the components and starts the subscriber fan-out.
    ///
    /// Must be called from within a tokio runtime. Watchers start only when
    /// the broker is run.
    pub fn build(self) -> Arc<Broker> {
        let cfg = self.cfg;
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let runtime_token = CancellationToken::new();

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new(cfg.default_namespace.clone())));
        let client = ResourceClient::new(backend, &cfg);

        let lock_backend = self
            .lock_backend
            .unwrap_or_else(|| Arc::new(MemoryLockBackend::new()));
        let locks = LockManager::new(lock_backend, &cfg, bus.clone());
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(StaticCatalog::default()));
        let controller = BrokerController::new(client.clone(), locks, catalog, &cfg, bus.clone());

        let registry = PollerRegistry::new(bus.clone(), runtime_token.clone());
        let watchers = self
            .watches
            .into_iter()
            .map(|w| {
                Arc::new(OperationWatcher::new(
                    client.clone(),
                    w.source,
                    Arc::clone(&registry),
                    &cfg,
                    bus.clone(),
                    w.group,
                    w.kind,
                ))
            })
            .collect();

        let broker = Arc::new(Broker::new_internal(
            cfg,
            bus,
            subs,
            controller,
            registry,
            watchers,
            runtime_token,
        ));
        broker.subscriber_listener();
        broker
    }
}
