//! Lifecycle requests as the HTTP layer hands them to the controller.
//!
//! `params` is the request body (or query for deletes); the controller stores
//! it as the resource `spec`.

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Multi-step flow that replaces the instance patch of an update.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServiceFlowRef {
    pub name: String,
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub plan_id: String,
    /// `previous_values.plan_id`; `None` means the plan is unchanged.
    #[serde(default)]
    pub previous_plan_id: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub service_flow: Option<ServiceFlowRef>,
    #[serde(default)]
    pub user: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LastOperationRequest {
    pub instance_id: String,
    /// Encoded operation token, if the caller has one.
    #[serde(default)]
    pub operation: Option<String>,
    /// Needed only under plan addressing.
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl ProvisionRequest {
    pub fn new(instance_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            plan_id: plan_id.into(),
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

impl UpdateRequest {
    pub fn new(instance_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            plan_id: plan_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_plan(mut self, previous_plan_id: impl Into<String>) -> Self {
        self.previous_plan_id = Some(previous_plan_id.into());
        self
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn service_flow(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.service_flow = Some(ServiceFlowRef {
            name: name.into(),
            id: id.into(),
        });
        self
    }
}

impl DeprovisionRequest {
    pub fn new(instance_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            plan_id: plan_id.into(),
            params: Map::new(),
        }
    }
}

impl BindRequest {
    pub fn new(
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            binding_id: binding_id.into(),
            plan_id: plan_id.into(),
            params: Map::new(),
        }
    }
}

impl UnbindRequest {
    pub fn new(
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            binding_id: binding_id.into(),
            plan_id: plan_id.into(),
            params: Map::new(),
        }
    }
}

impl LastOperationRequest {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn operation(mut self, token: impl Into<String>) -> Self {
        self.operation = Some(token.into());
        self
    }

    #[must_use]
    pub fn plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}
