//! Resource model: states, coordinates, metadata and decoded objects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

/// Label carrying the denormalized `status.state`.
pub const STATE_LABEL: &str = "state";

/// Label linking a binding (or flow) to its parent instance.
pub const INSTANCE_LABEL: &str = "instance_guid";

/// Lifecycle state of a resource.
///
/// Serialized in snake case (`in_queue`, `delete_failed`, ...), which is also
/// the value of the `state` label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    InQueue,
    InProgress,
    Succeeded,
    Failed,
    Update,
    Delete,
    DeleteFailed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::InQueue => "in_queue",
            ResourceState::InProgress => "in_progress",
            ResourceState::Succeeded => "succeeded",
            ResourceState::Failed => "failed",
            ResourceState::Update => "update",
            ResourceState::Delete => "delete",
            ResourceState::DeleteFailed => "delete_failed",
        }
    }

    /// `Failed` or `DeleteFailed`.
    pub fn is_failure(&self) -> bool {
        matches!(self, ResourceState::Failed | ResourceState::DeleteFailed)
    }

    /// States after which the operator does no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceState::Succeeded | ResourceState::Failed | ResourceState::DeleteFailed
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "in_queue" => ResourceState::InQueue,
            "in_progress" => ResourceState::InProgress,
            "succeeded" => ResourceState::Succeeded,
            "failed" => ResourceState::Failed,
            "update" => ResourceState::Update,
            "delete" => ResourceState::Delete,
            "delete_failed" => ResourceState::DeleteFailed,
            other => return Err(BrokerError::bad_request(format!("unknown state '{other}'"))),
        })
    }
}

/// Address of a resource: `(group, kind, id)` plus an optional namespace.
///
/// When `namespace` is `None` the client derives it from `id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub group: String,
    pub kind: String,
    pub id: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            id: id.into(),
            namespace: None,
        }
    }

    /// Pins the namespace instead of deriving it from the id.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", self.group, self.kind, ns, self.id),
            None => write!(f, "{}/{}/{}", self.group, self.kind, self.id),
        }
    }
}

/// Fully resolved backend address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Object metadata maintained by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Opaque optimistic-concurrency token. Empty on create requests.
    #[serde(default)]
    pub resource_version: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            resource_version: String::new(),
            creation_timestamp: Utc::now(),
            finalizers: Vec::new(),
        }
    }
}

/// Object as held by the backend: `spec`/`status` sub-documents are still JSON-in-string encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Map<String, Value>,
    #[serde(default)]
    pub status: Map<String, Value>,
}

/// Decoded resource as seen by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub group: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: Map<String, Value>,
    pub status: Map<String, Value>,
}

impl Resource {
    pub fn id(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    /// Parsed `status.state`, if present and known.
    pub fn state(&self) -> Option<ResourceState> {
        self.status
            .get("state")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Raw `status.state` string (unknown values included).
    pub fn state_str(&self) -> Option<&str> {
        self.status.get("state").and_then(Value::as_str)
    }

    pub fn status_field(&self, key: &str) -> Option<&Value> {
        self.status.get(key)
    }

    pub fn spec_field(&self, key: &str) -> Option<&Value> {
        self.spec.get(key)
    }

    /// Address pinned to this resource's namespace.
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(&self.group, &self.kind, self.id()).in_namespace(self.namespace())
    }
}
