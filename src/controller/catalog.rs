//! Plan lookup consumed by the controller.
//!
//! Catalog loading and caching live outside the broker; the controller only
//! needs a read-only [`Catalog::plan`] lookup.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};

use super::core::{BINDING_KIND, INSTANCE_KIND, OSB_GROUP};

/// Plan reference data.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Service manager name, used in dashboard URLs.
    pub manager: String,
    /// Whether lifecycle verbs answer `202 Accepted` instead of waiting.
    pub asynchronous: bool,
    pub resource_group: String,
    pub resource_type: String,
    pub bind_resource_group: String,
    pub bind_resource_type: String,
    /// Plan ids this plan may be updated from.
    pub update_predecessors: Vec<String>,
    pub schemas: Option<Value>,
}

impl Plan {
    /// Synchronous plan addressed through the interoperator OSB resources.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manager: "interoperator".to_string(),
            asynchronous: false,
            resource_group: OSB_GROUP.to_string(),
            resource_type: INSTANCE_KIND.to_string(),
            bind_resource_group: OSB_GROUP.to_string(),
            bind_resource_type: BINDING_KIND.to_string(),
            update_predecessors: Vec::new(),
            schemas: None,
        }
    }

    #[must_use]
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    #[must_use]
    pub fn manager(mut self, manager: impl Into<String>) -> Self {
        self.manager = manager.into();
        self
    }

    #[must_use]
    pub fn resource(mut self, group: impl Into<String>, kind: impl Into<String>) -> Self {
        self.resource_group = group.into();
        self.resource_type = kind.into();
        self
    }

    #[must_use]
    pub fn bind_resource(mut self, group: impl Into<String>, kind: impl Into<String>) -> Self {
        self.bind_resource_group = group.into();
        self.bind_resource_type = kind.into();
        self
    }

    #[must_use]
    pub fn update_predecessors<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_predecessors = ids.into_iter().map(Into::into).collect();
        self
    }

    /// `true` when an instance on `previous` may move to this plan.
    pub fn allows_update_from(&self, previous: &str) -> bool {
        previous == self.id || self.update_predecessors.iter().any(|p| p == previous)
    }
}

/// Read-only plan lookup.
pub trait Catalog: Send + Sync + 'static {
    /// Returns the plan or [`BrokerError::BadRequest`] for an unknown id.
    fn plan(&self, id: &str) -> BrokerResult<Plan>;
}

/// Fixed in-memory catalog.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    plans: HashMap<String, Plan>,
}

impl StaticCatalog {
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn insert(&mut self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }
}

impl Catalog for StaticCatalog {
    fn plan(&self, id: &str) -> BrokerResult<Plan> {
        self.plans
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::bad_request(format!("Could not find plan with id '{id}'")))
    }
}
