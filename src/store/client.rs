//! # Typed resource client.
//!
//! [`ResourceClient`] maps broker-level resource operations onto a
//! [`ResourceBackend`]. It owns no state of its own; everything lives in the
//! backend, so it is safe to share across requests and replicas.
//!
//! Responsibilities:
//! - namespace derivation (`sf-<id>` under resource isolation) and lazy creation
//! - JSON-in-string encoding of `spec`/`status` fields (see [`codec`](super::codec))
//! - keeping the `state` label in step with `status.state`
//! - read-merge-write patches with `resourceVersion` conflict retries
//! - reclassifying backend status codes into [`BrokerError`]

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::policies::BackoffPolicy;
use crate::store::backend::{RawWatchEvent, ResourceBackend, WatchEventKind};
use crate::store::codec;
use crate::store::resource::{
    ObjectKey, ObjectMeta, RawObject, Resource, ResourceRef, ResourceState, STATE_LABEL,
};
use crate::store::selector::LabelSelector;

/// Prefix of isolated per-instance namespaces.
pub const NAMESPACE_PREFIX: &str = "sf-";

/// A resource to be created.
#[derive(Clone, Debug)]
pub struct NewResource {
    pub target: ResourceRef,
    pub labels: BTreeMap<String, String>,
    pub spec: Map<String, Value>,
    pub status: Map<String, Value>,
}

impl NewResource {
    pub fn new(target: ResourceRef) -> Self {
        Self {
            target,
            labels: BTreeMap::new(),
            spec: Map::new(),
            status: Map::new(),
        }
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn spec(mut self, spec: Map<String, Value>) -> Self {
        self.spec = spec;
        self
    }

    #[must_use]
    pub fn spec_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spec.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn status(mut self, status: Map<String, Value>) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn state(mut self, state: ResourceState) -> Self {
        self.status
            .insert("state".into(), Value::from(state.as_str()));
        self
    }
}

/// Delta applied by [`ResourceClient::patch`].
///
/// `spec` and `status` are deep-merged; labels are overwritten key by key.
#[derive(Clone, Debug, Default)]
pub struct ResourcePatch {
    pub spec: Map<String, Value>,
    pub status: Map<String, Value>,
    pub labels: BTreeMap<String, String>,
}

impl ResourcePatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn spec(mut self, spec: Map<String, Value>) -> Self {
        self.spec = spec;
        self
    }

    #[must_use]
    pub fn spec_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spec.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn status_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.status.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn state(self, state: ResourceState) -> Self {
        self.status_field("state", Value::from(state.as_str()))
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.spec.is_empty() && self.status.is_empty() && self.labels.is_empty()
    }
}

/// Change notification with a decoded resource.
#[derive(Clone, Debug)]
pub struct ResourceEvent {
    pub kind: WatchEventKind,
    pub resource: Resource,
}

pub type ResourceWatch = BoxStream<'static, BrokerResult<ResourceEvent>>;

/// Outcome of a status read used by the protocol controller.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusView {
    pub state: Option<String>,
    pub description: Option<String>,
    pub response: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Clone, Debug)]
struct ClientSettings {
    resource_isolation: bool,
    default_namespace: String,
    patch_retry: BackoffPolicy,
    patch_attempts: u32,
}

/// Stateless façade over a [`ResourceBackend`].
#[derive(Clone)]
pub struct ResourceClient {
    backend: Arc<dyn ResourceBackend>,
    settings: ClientSettings,
}

impl ResourceClient {
    pub fn new(backend: Arc<dyn ResourceBackend>, cfg: &BrokerConfig) -> Self {
        Self {
            backend,
            settings: ClientSettings {
                resource_isolation: cfg.resource_isolation,
                default_namespace: cfg.default_namespace.clone(),
                patch_retry: cfg.patch_retry,
                patch_attempts: cfg.patch_attempts_clamped(),
            },
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.settings.default_namespace
    }

    /// Namespace that holds resources derived from `id`.
    pub fn namespace_for(&self, id: &str) -> String {
        if self.settings.resource_isolation {
            format!("{NAMESPACE_PREFIX}{id}")
        } else {
            self.settings.default_namespace.clone()
        }
    }

    fn key(&self, target: &ResourceRef) -> ObjectKey {
        ObjectKey {
            group: target.group.clone(),
            kind: target.kind.clone(),
            namespace: target
                .namespace
                .clone()
                .unwrap_or_else(|| self.namespace_for(&target.id)),
            name: target.id.clone(),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> BrokerResult<()> {
        if namespace == self.settings.default_namespace {
            return Ok(());
        }
        match self.backend.create_namespace(namespace).await {
            Ok(()) => {
                debug!(namespace, "created namespace");
                Ok(())
            }
            Err(e) => match BrokerError::from(e) {
                BrokerError::Conflict { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    /// Creates a resource, creating its namespace first when needed.
    ///
    /// A name collision surfaces as [`BrokerError::Conflict`].
    pub async fn create(&self, new: NewResource) -> BrokerResult<Resource> {
        let key = self.key(&new.target);
        self.ensure_namespace(&key.namespace).await?;

        let mut metadata = ObjectMeta::new(&key.name, &key.namespace);
        metadata.labels = new.labels;
        if let Some(state) = new.status.get("state").and_then(Value::as_str) {
            metadata.labels.insert(STATE_LABEL.into(), state.into());
        }

        let raw = RawObject {
            metadata,
            spec: codec::encode_fields(&new.spec)?,
            status: codec::encode_fields(&new.status)?,
        };
        debug!(group = %key.group, kind = %key.kind, id = %key.name, ns = %key.namespace, "create");
        let stored = self.backend.create(&key.group, &key.kind, raw).await?;
        Ok(decode(&key.group, &key.kind, stored))
    }

    pub async fn get(&self, target: &ResourceRef) -> BrokerResult<Resource> {
        let key = self.key(target);
        let raw = self.backend.get(&key).await?;
        Ok(decode(&key.group, &key.kind, raw))
    }

    /// Deep-merges `delta` into the stored resource.
    ///
    /// Each attempt re-reads the object and writes with the read
    /// `resourceVersion`; a lost race is retried with backoff up to the
    /// configured attempt budget.
    pub async fn patch(&self, target: &ResourceRef, delta: ResourcePatch) -> BrokerResult<Resource> {
        let key = self.key(target);
        let mut attempt = 0u32;
        loop {
            match self.patch_once(&key, &delta).await {
                Err(BrokerError::Conflict { message })
                    if attempt + 1 < self.settings.patch_attempts =>
                {
                    let delay = self.settings.patch_retry.next(attempt);
                    debug!(id = %key.name, attempt, ?delay, %message, "patch conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn patch_once(&self, key: &ObjectKey, delta: &ResourcePatch) -> BrokerResult<Resource> {
        let current = self.backend.get(key).await?;

        let mut spec = codec::decode_fields(&current.spec);
        codec::merge_maps(&mut spec, &delta.spec);
        let mut status = codec::decode_fields(&current.status);
        codec::merge_maps(&mut status, &delta.status);

        let mut metadata = current.metadata;
        metadata.labels.extend(delta.labels.clone());
        if let Some(state) = status.get("state").and_then(Value::as_str) {
            metadata.labels.insert(STATE_LABEL.into(), state.into());
        }

        let raw = RawObject {
            metadata,
            spec: codec::encode_fields(&spec)?,
            status: codec::encode_fields(&status)?,
        };
        let stored = self.backend.replace(&key.group, &key.kind, raw).await?;
        Ok(decode(&key.group, &key.kind, stored))
    }

    /// Merges `status` into the resource's status.
    pub async fn update_status(
        &self,
        target: &ResourceRef,
        status: Map<String, Value>,
    ) -> BrokerResult<Resource> {
        let delta = ResourcePatch {
            status,
            ..ResourcePatch::default()
        };
        self.patch(target, delta).await
    }

    /// Lists resources ordered by creation time (then name).
    pub async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> BrokerResult<Vec<Resource>> {
        let raw = self.backend.list(group, kind, namespace, selector).await?;
        let mut out: Vec<Resource> = raw.into_iter().map(|r| decode(group, kind, r)).collect();
        out.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Ok(out)
    }

    /// Lists resources whose `state` label is one of `states`, across namespaces.
    pub async fn list_by_state(
        &self,
        group: &str,
        kind: &str,
        states: &[ResourceState],
    ) -> BrokerResult<Vec<Resource>> {
        self.list(group, kind, None, &LabelSelector::state_in(states))
            .await
    }

    /// Deletes a resource.
    ///
    /// When the resource lives in the isolation namespace derived from its own
    /// id, that namespace is deleted too. Bindings live in their parent's
    /// namespace and never trigger this.
    pub async fn delete(&self, target: &ResourceRef) -> BrokerResult<()> {
        let key = self.key(target);
        self.backend.delete(&key).await?;
        debug!(group = %key.group, kind = %key.kind, id = %key.name, "deleted");

        let owned_ns = self.settings.resource_isolation
            && key.namespace != self.settings.default_namespace
            && key.namespace == self.namespace_for(&key.name);
        if owned_ns {
            match self.backend.delete_namespace(&key.namespace).await {
                Ok(()) => {}
                Err(e) => match BrokerError::from(e) {
                    BrokerError::NotFound { .. } => {}
                    other => return Err(other),
                },
            }
        }
        Ok(())
    }

    /// Opens a decoded watch stream for `(group, kind)` across all namespaces.
    pub async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> BrokerResult<ResourceWatch> {
        let raw = self.backend.watch(group, kind, selector).await?;
        let group = group.to_string();
        let kind = kind.to_string();
        Ok(raw
            .map(move |item| {
                item.map(|RawWatchEvent { kind: ev, object }| ResourceEvent {
                    kind: ev,
                    resource: decode(&group, &kind, object),
                })
                .map_err(BrokerError::from)
            })
            .boxed())
    }

    /// Records `value` in the `last_<name>_<type>` label.
    pub async fn update_last_operation(
        &self,
        target: &ResourceRef,
        operation_name: &str,
        operation_type: &str,
        value: &str,
    ) -> BrokerResult<Resource> {
        let label = last_operation_label(operation_name, operation_type);
        self.patch(target, ResourcePatch::new().label(label, value))
            .await
    }

    pub async fn last_operation_value(
        &self,
        target: &ResourceRef,
        operation_name: &str,
        operation_type: &str,
    ) -> BrokerResult<Option<String>> {
        let label = last_operation_label(operation_name, operation_type);
        Ok(self.get(target).await?.metadata.labels.get(&label).cloned())
    }

    /// Drops `finalizer`, writing with the read `resourceVersion`.
    pub async fn remove_finalizer(&self, target: &ResourceRef, finalizer: &str) -> BrokerResult<()> {
        let key = self.key(target);
        let mut current = self.backend.get(&key).await?;
        let before = current.metadata.finalizers.len();
        current.metadata.finalizers.retain(|f| f != finalizer);
        if current.metadata.finalizers.len() != before {
            self.backend.replace(&key.group, &key.kind, current).await?;
        }
        Ok(())
    }

    pub async fn get_status(&self, target: &ResourceRef) -> BrokerResult<StatusView> {
        let r = self.get(target).await?;
        Ok(StatusView {
            state: r.state_str().map(String::from),
            description: r
                .status_field("description")
                .and_then(Value::as_str)
                .map(String::from),
            response: r.status_field("response").cloned(),
            error: r.status_field("error").cloned(),
        })
    }

    pub async fn get_state(&self, target: &ResourceRef) -> BrokerResult<Option<ResourceState>> {
        Ok(self.get(target).await?.state())
    }

    pub async fn get_response(&self, target: &ResourceRef) -> BrokerResult<Option<Value>> {
        Ok(self.get(target).await?.status_field("response").cloned())
    }

    pub async fn get_spec_field(&self, target: &ResourceRef, key: &str) -> BrokerResult<Option<Value>> {
        Ok(self.get(target).await?.spec_field(key).cloned())
    }
}

pub fn last_operation_label(operation_name: &str, operation_type: &str) -> String {
    format!("last_{operation_name}_{operation_type}")
}

fn decode(group: &str, kind: &str, raw: RawObject) -> Resource {
    Resource {
        group: group.to_string(),
        kind: kind.to_string(),
        spec: codec::decode_fields(&raw.spec),
        status: codec::decode_fields(&raw.status),
        metadata: raw.metadata,
    }
}
