//! In-memory [`ResourceBackend`].
//!
//! Keeps objects in a `BTreeMap` behind a tokio `RwLock`, stamps a global
//! `resourceVersion` counter on every write, and broadcasts changes to watch
//! streams. A configurable maximum watch duration ends streams the way an API
//! server expires watch leases.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use crate::store::backend::{
    BackendError, RawWatchEvent, RawWatchStream, ResourceBackend, WatchEventKind,
};
use crate::store::resource::{ObjectKey, RawObject};
use crate::store::selector::LabelSelector;

type Kind = (String, String);

struct Inner {
    namespaces: HashSet<String>,
    objects: BTreeMap<ObjectKey, RawObject>,
    next_version: u64,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Reference backend used by tests and single-process deployments.
pub struct MemoryBackend {
    inner: RwLock<Inner>,
    events: broadcast::Sender<(Kind, RawWatchEvent)>,
    max_watch: Option<Duration>,
}

impl MemoryBackend {
    /// Creates a backend with the given default namespace pre-created.
    pub fn new(default_namespace: impl Into<String>) -> Self {
        let mut namespaces = HashSet::new();
        namespaces.insert(default_namespace.into());
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                namespaces,
                objects: BTreeMap::new(),
                next_version: 0,
            }),
            events,
            max_watch: None,
        }
    }

    /// Ends every watch stream after `d`.
    #[must_use]
    pub fn with_max_watch_duration(mut self, d: Duration) -> Self {
        self.max_watch = Some(d);
        self
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.inner.read().await.namespaces.contains(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, group: &str, kind: &str, ev_kind: WatchEventKind, object: &RawObject) {
        let ev = RawWatchEvent {
            kind: ev_kind,
            object: object.clone(),
        };
        let _ = self.events.send(((group.to_string(), kind.to_string()), ev));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("default")
    }
}

fn key_of(group: &str, kind: &str, object: &RawObject) -> ObjectKey {
    ObjectKey {
        group: group.to_string(),
        kind: kind.to_string(),
        namespace: object.metadata.namespace.clone(),
        name: object.metadata.name.clone(),
    }
}

fn describe(key: &ObjectKey) -> String {
    format!("{}/{} '{}' in namespace '{}'", key.group, key.kind, key.name, key.namespace)
}

#[async_trait]
impl ResourceBackend for MemoryBackend {
    async fn create_namespace(&self, name: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.write().await;
        if !inner.namespaces.insert(name.to_string()) {
            return Err(BackendError::conflict(format!("namespace '{name}' already exists")));
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.write().await;
        if !inner.namespaces.remove(name) {
            return Err(BackendError::not_found(format!("namespace '{name}' not found")));
        }
        inner.objects.retain(|k, _| k.namespace != name);
        Ok(())
    }

    async fn create(
        &self,
        group: &str,
        kind: &str,
        mut object: RawObject,
    ) -> Result<RawObject, BackendError> {
        let key = key_of(group, kind, &object);
        let mut inner = self.inner.write().await;
        if !inner.namespaces.contains(&key.namespace) {
            return Err(BackendError::not_found(format!(
                "namespace '{}' not found",
                key.namespace
            )));
        }
        if inner.objects.contains_key(&key) {
            return Err(BackendError::conflict(format!("{} already exists", describe(&key))));
        }
        object.metadata.resource_version = inner.bump();
        object.metadata.creation_timestamp = Utc::now();
        inner.objects.insert(key, object.clone());
        drop(inner);
        self.notify(group, kind, WatchEventKind::Added, &object);
        Ok(object)
    }

    async fn get(&self, key: &ObjectKey) -> Result<RawObject, BackendError> {
        self.inner
            .read()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("{} not found", describe(key))))
    }

    async fn replace(
        &self,
        group: &str,
        kind: &str,
        mut object: RawObject,
    ) -> Result<RawObject, BackendError> {
        let key = key_of(group, kind, &object);
        let mut inner = self.inner.write().await;
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| BackendError::not_found(format!("{} not found", describe(&key))))?;
        let sent = &object.metadata.resource_version;
        if !sent.is_empty() && *sent != current.metadata.resource_version {
            return Err(BackendError::conflict(format!(
                "{} was modified (resourceVersion {} != {})",
                describe(&key),
                sent,
                current.metadata.resource_version
            )));
        }
        object.metadata.creation_timestamp = current.metadata.creation_timestamp;
        object.metadata.resource_version = inner.bump();
        inner.objects.insert(key, object.clone());
        drop(inner);
        self.notify(group, kind, WatchEventKind::Modified, &object);
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), BackendError> {
        let removed = self.inner.write().await.objects.remove(key);
        match removed {
            Some(object) => {
                self.notify(&key.group, &key.kind, WatchEventKind::Deleted, &object);
                Ok(())
            }
            None => Err(BackendError::not_found(format!("{} not found", describe(key)))),
        }
    }

    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<RawObject>, BackendError> {
        let inner = self.inner.read().await;
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.group == group && k.kind == kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| ns == k.namespace))
            .filter(|(_, o)| selector.matches(&o.metadata.labels))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<RawWatchStream, BackendError> {
        // Subscribe before the snapshot so no write falls between the two.
        let rx = self.events.subscribe();
        let initial = self.list(group, kind, None, selector).await?;

        let replay = futures::stream::iter(initial.into_iter().map(|object| {
            Ok::<_, BackendError>(RawWatchEvent {
                kind: WatchEventKind::Added,
                object,
            })
        }));

        let wanted: Kind = (group.to_string(), kind.to_string());
        let selector = selector.clone();
        let deadline = self.max_watch.map(|d| Instant::now() + d);

        let live = futures::stream::unfold(Some(rx), move |state| {
            let wanted = wanted.clone();
            let selector = selector.clone();
            async move {
                let mut rx = state?;
                loop {
                    let next = match deadline {
                        Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                            Ok(r) => r,
                            Err(_) => return None,
                        },
                        None => rx.recv().await,
                    };
                    match next {
                        Ok((k, ev)) => {
                            if k == wanted && selector.matches(&ev.object.metadata.labels) {
                                return Some((Ok(ev), Some(rx)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = BackendError::new(410, format!("watch lagged by {n} events"));
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(replay.chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resource::ObjectMeta;

    fn object(ns: &str, name: &str, state: &str) -> RawObject {
        let mut metadata = ObjectMeta::new(name, ns);
        metadata.labels.insert("state".into(), state.into());
        RawObject {
            metadata,
            spec: Default::default(),
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let b = MemoryBackend::default();
        let created = b.create("g", "k", object("default", "a", "in_queue")).await.unwrap();
        let first = b.replace("g", "k", created.clone()).await.unwrap();
        assert_ne!(first.metadata.resource_version, created.metadata.resource_version);

        let err = b.replace("g", "k", created).await.unwrap_err();
        assert_eq!(err.code, 409);
    }

    #[tokio::test]
    async fn test_create_requires_namespace() {
        let b = MemoryBackend::default();
        let err = b.create("g", "k", object("sf-x", "x", "in_queue")).await.unwrap_err();
        assert_eq!(err.code, 404);
        b.create_namespace("sf-x").await.unwrap();
        b.create("g", "k", object("sf-x", "x", "in_queue")).await.unwrap();
        assert_eq!(b.create_namespace("sf-x").await.unwrap_err().code, 409);
        b.delete_namespace("sf-x").await.unwrap();
        assert!(b.is_empty().await);
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams_and_expires() {
        let b = MemoryBackend::default().with_max_watch_duration(Duration::from_millis(100));
        b.create("g", "k", object("default", "old", "in_progress")).await.unwrap();
        b.create("g", "k", object("default", "done", "succeeded")).await.unwrap();

        let sel = LabelSelector::parse("state in (in_progress)").unwrap();
        let mut stream = b.watch("g", "k", &sel).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.kind, WatchEventKind::Added);
        assert_eq!(first.object.metadata.name, "old");

        b.create("g", "other", object("default", "x", "in_progress")).await.unwrap();
        b.create("g", "k", object("default", "new", "in_progress")).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.object.metadata.name, "new");

        assert!(stream.next().await.is_none());
    }
}
