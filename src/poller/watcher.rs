//! # Background reconciliation of in-progress resources.
//!
//! [`OperationWatcher`] watches `(group, kind)` for `state in (in_progress)`.
//! For every matching resource it ensures one background poller exists in the
//! injected [`PollerRegistry`], keyed by `group/kind/namespace/id`. A poller asks the [`OperationSource`] for the
//! external operation's status every `watcher_poll_interval` and, on a
//! terminal answer, patches the resource's status and removes itself.
//!
//! ## Watch lifecycle
//! ```text
//! run(token):
//!   loop {
//!     watch(selector) ─ Err ─► WatchFailed, sleep(backoff(n)), retry
//!        │ Ok
//!        ▼ WatchEstablished
//!     select {
//!       cancelled          → return
//!       refresh elapsed    → WatchRefreshed, re-subscribe
//!       stream item        → Added/Modified → ensure poller
//!       stream error       → WatchFailed, sleep(backoff(n)), re-subscribe
//!       stream end (lease) → re-subscribe
//!     }
//!   }
//! ```
//!
//! Pollers are bounded by `poller_max_lifetime`: once exceeded, the resource
//! is marked failed with a timeout error instead of polling forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;
use crate::poller::registry::PollerRegistry;
use crate::store::{
    LabelSelector, Resource, ResourceClient, ResourcePatch, ResourceRef, ResourceState,
    WatchEventKind,
};

/// Status of an external long-running operation.
#[derive(Clone, Debug, PartialEq)]
pub enum ExternalStatus {
    InProgress { description: Option<String> },
    Succeeded { response: Value },
    Failed { error: Value },
}

/// Feed of external operation status (task service, IaaS API, ...).
#[async_trait]
pub trait OperationSource: Send + Sync + 'static {
    async fn poll(&self, resource: &Resource) -> BrokerResult<ExternalStatus>;
}

#[derive(Clone)]
struct PollerSettings {
    interval: Duration,
    max_lifetime: Option<Duration>,
}

/// Watches one resource kind and drives background pollers for it.
pub struct OperationWatcher {
    client: ResourceClient,
    source: Arc<dyn OperationSource>,
    registry: Arc<PollerRegistry>,
    bus: Bus,
    group: String,
    kind: String,
    refresh: Duration,
    retry: BackoffPolicy,
    poller: PollerSettings,
}

impl OperationWatcher {
    pub fn new(
        client: ResourceClient,
        source: Arc<dyn OperationSource>,
        registry: Arc<PollerRegistry>,
        cfg: &BrokerConfig,
        bus: Bus,
        group: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            client,
            source,
            registry,
            bus,
            group: group.into(),
            kind: kind.into(),
            refresh: cfg.watch_refresh_interval,
            retry: BackoffPolicy {
                first: Duration::from_millis(200),
                max: cfg.watch_refresh_interval.max(Duration::from_millis(200)),
                ..cfg.patch_retry
            },
            poller: PollerSettings {
                interval: cfg.watcher_poll_interval,
                max_lifetime: cfg.poller_max_lifetime(),
            },
        }
    }

    /// `<group>/<kind>` this watcher reconciles.
    pub fn target(&self) -> String {
        format!("{}/{}", self.group, self.kind)
    }

    /// Runs until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let selector = LabelSelector::state_in(&[ResourceState::InProgress]);
        let mut failures = 0u32;

        while !token.is_cancelled() {
            let mut stream = match self.client.watch(&self.group, &self.kind, &selector).await {
                Ok(s) => s,
                Err(e) => {
                    if self.backoff(&token, &mut failures, e.to_string()).await {
                        return;
                    }
                    continue;
                }
            };
            self.bus
                .publish(Event::new(EventKind::WatchEstablished).with_resource(self.target()));

            let refresh = tokio::time::sleep(self.refresh);
            tokio::pin!(refresh);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = &mut refresh => {
                        self.bus.publish(
                            Event::new(EventKind::WatchRefreshed).with_resource(self.target()),
                        );
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(ev)) => {
                            failures = 0;
                            if ev.kind != WatchEventKind::Deleted {
                                self.on_resource(ev.resource).await;
                            }
                        }
                        Some(Err(e)) => {
                            if self.backoff(&token, &mut failures, e.to_string()).await {
                                return;
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Publishes `WatchFailed` and sleeps; returns `true` if cancelled meanwhile.
    async fn backoff(&self, token: &CancellationToken, failures: &mut u32, reason: String) -> bool {
        let delay = self.retry.next(*failures);
        *failures = failures.saturating_add(1);
        self.bus.publish(
            Event::new(EventKind::WatchFailed)
                .with_resource(self.target())
                .with_reason(reason)
                .with_delay(delay),
        );
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn on_resource(&self, resource: Resource) {
        if resource.state() != Some(ResourceState::InProgress) {
            return;
        }
        // Same name may exist under another kind or namespace.
        let key = resource.reference().to_string();
        let task = PollerTask {
            client: self.client.clone(),
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
            settings: self.poller.clone(),
            resource,
        };
        self.registry
            .spawn_if_absent(&key, move |token| task.run(token))
            .await;
    }
}

struct PollerTask {
    client: ResourceClient,
    source: Arc<dyn OperationSource>,
    registry: Arc<PollerRegistry>,
    bus: Bus,
    settings: PollerSettings,
    resource: Resource,
}

enum Finish {
    Terminal(ResourceState),
    /// Someone else moved the resource on (or removed it).
    Settled(Option<ResourceState>),
    Expired,
    Cancelled,
}

impl PollerTask {
    async fn run(self, token: CancellationToken) {
        let name = self.resource.id().to_string();
        let target = self.resource.reference();
        let key = target.to_string();
        let started = Instant::now();

        let finish = loop {
            tokio::select! {
                _ = token.cancelled() => break Finish::Cancelled,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            match self.client.get(&target).await {
                Ok(current) if current.state() != Some(ResourceState::InProgress) => {
                    break Finish::Settled(current.state());
                }
                Err(e) if e.is_not_found() => break Finish::Settled(None),
                _ => {}
            }

            if self
                .settings
                .max_lifetime
                .is_some_and(|max| started.elapsed() >= max)
            {
                let error = json!({
                    "code": 504,
                    "message": format!("operation on '{name}' did not finish within {:?}", started.elapsed()),
                });
                self.finish(&target, ResourceState::Failed, "error", error)
                    .await;
                break Finish::Expired;
            }

            match self.source.poll(&self.resource).await {
                Ok(ExternalStatus::InProgress { description }) => {
                    let mut ev = Event::new(EventKind::PollerTick)
                        .with_resource(name.as_str())
                        .with_state(ResourceState::InProgress.as_str());
                    if let Some(d) = description {
                        ev = ev.with_reason(d);
                    }
                    self.bus.publish(ev);
                }
                Ok(ExternalStatus::Succeeded { response }) => {
                    self.finish(&target, ResourceState::Succeeded, "response", response)
                        .await;
                    break Finish::Terminal(ResourceState::Succeeded);
                }
                Ok(ExternalStatus::Failed { error }) => {
                    self.finish(&target, ResourceState::Failed, "error", error)
                        .await;
                    break Finish::Terminal(ResourceState::Failed);
                }
                Err(e) => {
                    self.bus.publish(
                        Event::new(EventKind::PollerTick)
                            .with_resource(name.as_str())
                            .with_reason(e.to_string()),
                    );
                }
            }
        };

        // A cancelled poller stays registered so the registry can join it.
        if !matches!(finish, Finish::Cancelled) {
            self.registry.remove(&key).await;
        }
        let mut ev = Event::new(EventKind::PollerStopped)
            .with_resource(name.as_str())
            .with_elapsed(started.elapsed());
        ev = match finish {
            Finish::Terminal(state) | Finish::Settled(Some(state)) => ev.with_state(state.as_str()),
            Finish::Settled(None) => ev.with_reason("resource removed"),
            Finish::Expired => ev
                .with_state(ResourceState::Failed.as_str())
                .with_reason("max lifetime exceeded"),
            Finish::Cancelled => ev.with_reason("cancelled"),
        };
        self.bus.publish(ev);
    }

    async fn finish(&self, target: &ResourceRef, state: ResourceState, field: &str, payload: Value) {
        let patch = ResourcePatch::new().state(state).status_field(field, payload);
        if let Err(e) = self.client.patch(target, patch).await {
            self.bus.publish(
                Event::new(EventKind::OperationFailed)
                    .with_resource(target.id.as_str())
                    .with_reason(format!("{}: {}", e.as_label(), e.as_message())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, NewResource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GROUP: &str = "backup.servicefabrik.io";
    const KIND: &str = "defaultbackups";

    /// Reports in-progress for `pending` polls, then success.
    struct Scripted {
        pending: usize,
        polls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl Scripted {
        fn new(pending: usize) -> Self {
            Self {
                pending,
                polls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OperationSource for Scripted {
        async fn poll(&self, _resource: &Resource) -> BrokerResult<ExternalStatus> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending {
                Ok(ExternalStatus::InProgress { description: None })
            } else {
                Ok(ExternalStatus::Succeeded {
                    response: json!({"snapshotId": "s1"}),
                })
            }
        }
    }

    fn cfg() -> BrokerConfig {
        BrokerConfig {
            watch_refresh_interval: Duration::from_millis(40),
            watcher_poll_interval: Duration::from_millis(10),
            ..BrokerConfig::default()
        }
    }

    async fn wait_for_state(client: &ResourceClient, r: &ResourceRef, want: ResourceState) {
        for _ in 0..200 {
            if client.get_state(r).await.unwrap() == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{r} never reached {want}");
    }

    #[tokio::test]
    async fn test_poller_survives_watch_refresh_and_completes_once() {
        let cfg = cfg();
        let backend = Arc::new(MemoryBackend::default().with_max_watch_duration(Duration::from_millis(25)));
        let client = ResourceClient::new(backend, &cfg);
        let bus = Bus::new(256);
        let token = CancellationToken::new();
        let registry = PollerRegistry::new(bus.clone(), token.clone());
        let source = Arc::new(Scripted::new(8));

        let r = ResourceRef::new(GROUP, KIND, "bk1");
        client
            .create(NewResource::new(r.clone()).state(ResourceState::InProgress))
            .await
            .unwrap();

        let watcher = Arc::new(OperationWatcher::new(
            client.clone(),
            source.clone(),
            Arc::clone(&registry),
            &cfg,
            bus.clone(),
            GROUP,
            KIND,
        ));
        let join = tokio::spawn(watcher.run(token.clone()));

        wait_for_state(&client, &r, ResourceState::Succeeded).await;
        let done = client.get(&r).await.unwrap();
        assert_eq!(done.status["response"], json!({"snapshotId": "s1"}));
        assert_eq!(source.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(source.polls.load(Ordering::SeqCst), 9);

        token.cancel();
        join.await.unwrap();
        assert!(registry.cancel_all(Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_under_two_kinds_gets_two_pollers() {
        const RESTORES: &str = "defaultrestores";

        let cfg = cfg();
        let client = ResourceClient::new(Arc::new(MemoryBackend::default()), &cfg);
        let bus = Bus::new(256);
        let token = CancellationToken::new();
        let registry = PollerRegistry::new(bus.clone(), token.clone());

        let backup = ResourceRef::new(GROUP, KIND, "op-1");
        let restore = ResourceRef::new(GROUP, RESTORES, "op-1");
        for r in [&backup, &restore] {
            client
                .create(NewResource::new(r.clone()).state(ResourceState::InProgress))
                .await
                .unwrap();
        }

        let mut joins = Vec::new();
        for (kind, pending) in [(KIND, 3), (RESTORES, 0)] {
            let watcher = Arc::new(OperationWatcher::new(
                client.clone(),
                Arc::new(Scripted::new(pending)),
                Arc::clone(&registry),
                &cfg,
                bus.clone(),
                GROUP,
                kind,
            ));
            joins.push(tokio::spawn(watcher.run(token.clone())));
        }

        wait_for_state(&client, &restore, ResourceState::Succeeded).await;
        wait_for_state(&client, &backup, ResourceState::Succeeded).await;

        token.cancel();
        for join in joins {
            join.await.unwrap();
        }
        assert!(registry.cancel_all(Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_poller_lifetime_bound_marks_failed() {
        let cfg = BrokerConfig {
            poller_max_lifetime: Duration::from_millis(50),
            ..cfg()
        };
        let client = ResourceClient::new(Arc::new(MemoryBackend::default()), &cfg);
        let bus = Bus::new(256);
        let token = CancellationToken::new();
        let registry = PollerRegistry::new(bus.clone(), token.clone());

        let r = ResourceRef::new(GROUP, KIND, "wedged");
        client
            .create(NewResource::new(r.clone()).state(ResourceState::InProgress))
            .await
            .unwrap();

        let watcher = Arc::new(OperationWatcher::new(
            client.clone(),
            Arc::new(Scripted::new(usize::MAX)),
            Arc::clone(&registry),
            &cfg,
            bus,
            GROUP,
            KIND,
        ));
        let join = tokio::spawn(watcher.run(token.clone()));

        wait_for_state(&client, &r, ResourceState::Failed).await;
        let failed = client.get(&r).await.unwrap();
        assert_eq!(failed.status["error"]["code"], json!(504));
        assert!(matches!(
            crate::poller::error_from_payload(&failed.status["error"]),
            crate::BrokerError::Timeout { .. }
        ));

        token.cancel();
        join.await.unwrap();
    }
}
