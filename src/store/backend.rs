//! # Resource backend boundary.
//!
//! [`ResourceBackend`] is the Kubernetes-style object API the broker consumes:
//! namespaced objects addressed by `(group, kind, namespace, name)`, labels for
//! selector queries, `resourceVersion` for optimistic concurrency and a watch
//! stream of change events.
//!
//! Backends report failures as a [`BackendError`] carrying an HTTP-like status
//! code. The client reclassifies it into [`BrokerError`] through
//! [`BrokerError::from_status`], so nothing above the client sees backend codes.
//!
//! ## Contract
//! - `create` fails with 409 if the name exists, 404 if the namespace does not.
//! - `replace` fails with 409 when `metadata.resource_version` is non-empty and stale.
//! - `list` returns an empty vector on zero matches.
//! - `watch` first replays matching objects as `Added`, then streams changes.
//!   The stream may end at any time (lease expiry); callers re-subscribe.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::error::BrokerError;
use crate::store::resource::{ObjectKey, RawObject};
use crate::store::selector::LabelSelector;

/// Failure reported by a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("backend error {code}: {message}")]
pub struct BackendError {
    pub code: u16,
    pub message: String,
}

impl BackendError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }
}

impl From<BackendError> for BrokerError {
    fn from(e: BackendError) -> Self {
        BrokerError::from_status(e.code, e.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// One change notification from a watch stream.
#[derive(Clone, Debug)]
pub struct RawWatchEvent {
    pub kind: WatchEventKind,
    pub object: RawObject,
}

pub type RawWatchStream = BoxStream<'static, Result<RawWatchEvent, BackendError>>;

/// Object store consumed by [`ResourceClient`](crate::store::ResourceClient).
#[async_trait]
pub trait ResourceBackend: Send + Sync + 'static {
    async fn create_namespace(&self, name: &str) -> Result<(), BackendError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), BackendError>;

    async fn create(&self, group: &str, kind: &str, object: RawObject)
        -> Result<RawObject, BackendError>;

    async fn get(&self, key: &ObjectKey) -> Result<RawObject, BackendError>;

    /// Replaces the whole object, checking `metadata.resource_version` when set.
    async fn replace(
        &self,
        group: &str,
        kind: &str,
        object: RawObject,
    ) -> Result<RawObject, BackendError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), BackendError>;

    /// Lists objects; `namespace = None` lists across all namespaces.
    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<RawObject>, BackendError>;

    /// Opens a watch across all namespaces.
    async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<RawWatchStream, BackendError>;
}
