//! # Lifecycle state machine.
//!
//! [`BrokerController`] sequences the store client, the operation poller and
//! (in locked deployments) the lock manager per protocol verb. One type serves
//! every deployment flavour; [`Capabilities`] selects the lock discipline and
//! the resource addressing.
//!
//! ```text
//! provision   create(in_queue) ── Conflict ─► 409
//!                 └─ sync plan ─► await(in_queue) ─► 201 | async ─► 202 + token{create}
//! update      plan transition check ─ illegal ─► BadRequest (no writes)
//!                 ├─ flow   ─► create serialserviceflow(in_queue)
//!                 └─ direct ─► patch instance(update)
//!                 └─ sync ─► await ─► 200 | async ─► 202 + token{update, flow?}
//! deprovision patch(delete) ── NotFound ─► 410
//!                 └─ sync ─► await(delete) ─► 200 | async ─► 202 + token{delete}
//! bind        create binding(in_queue) ── Conflict ─► 409
//!                 └─ await(in_queue) ─► 201 {credentials}
//! unbind      patch binding(delete) ── NotFound ─► create(delete)
//!                 └─ await(delete) ─► delete object ─► 200   (NotFound anywhere ─► 410)
//! last_op     decode token ─► read instance or flow status
//!                 └─ NotFound ─► 410 for deletes, "failed" otherwise
//! ```
//!
//! ## Locked deployments
//! Mutating instance verbs take the instance WRITE lock first. The lock is
//! released on every outcome except `202 Accepted`; an accepted operation
//! stays locked until last-operation observes it finished. Binds and unbinds
//! never lock but are rejected while the instance is write locked.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{Addressing, BrokerConfig, Capabilities};
use crate::error::{BrokerError, BrokerResult};
use crate::events::{Bus, Event, EventKind};
use crate::lock::LockManager;
use crate::poller::{OperationOutcome, OperationPoller};
use crate::store::{
    NewResource, ResourceClient, ResourcePatch, ResourceRef, ResourceState, INSTANCE_LABEL,
};

use super::catalog::{Catalog, Plan};
use super::request::{
    BindRequest, DeprovisionRequest, LastOperationRequest, ProvisionRequest, UnbindRequest,
    UpdateRequest,
};
use super::response::BrokerResponse;
use super::token::{decode_base64_json, OperationToken, OperationType};

/// Resource group of interoperator instances and bindings.
pub const OSB_GROUP: &str = "osb.servicefabrik.io";
pub const INSTANCE_KIND: &str = "sfserviceinstances";
pub const BINDING_KIND: &str = "sfservicebindings";
/// Resource group of multi-step service flows.
pub const SERVICE_FLOW_GROUP: &str = "serviceflow.servicefabrik.io";
pub const SERIAL_SERVICE_FLOW_KIND: &str = "serialserviceflows";

/// Protocol version assumed when the caller sends none.
const DEFAULT_API_VERSION: &str = "1.0";

/// Externally visible operation states.
const IN_PROGRESS: &str = "in progress";
const SUCCEEDED: &str = "succeeded";
const FAILED: &str = "failed";

/// Lifecycle controller parameterized by [`Capabilities`].
#[derive(Clone)]
pub struct BrokerController {
    client: ResourceClient,
    poller: OperationPoller,
    locks: Option<LockManager>,
    catalog: Arc<dyn Catalog>,
    bus: Bus,
    capabilities: Capabilities,
    min_api_version: String,
    dashboard: Option<(String, String)>,
}

impl BrokerController {
    /// Creates a controller.
    ///
    /// `locks` is consulted only when `cfg` selects [`LockMode::Locked`](crate::LockMode::Locked).
    pub fn new(
        client: ResourceClient,
        locks: LockManager,
        catalog: Arc<dyn Catalog>,
        cfg: &BrokerConfig,
        bus: Bus,
    ) -> Self {
        Self {
            poller: OperationPoller::new(client.clone(), cfg, bus.clone()),
            client,
            locks: cfg.is_locked().then_some(locks),
            catalog,
            bus,
            capabilities: cfg.capabilities,
            min_api_version: cfg.min_api_version.clone(),
            dashboard: cfg
                .dashboard
                .as_ref()
                .map(|d| (d.protocol.clone(), d.host.clone())),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn client(&self) -> &ResourceClient {
        &self.client
    }

    /// Rejects callers speaking a protocol older than the configured minimum.
    ///
    /// An absent header counts as version `1.0`.
    pub fn check_api_version(&self, header: Option<&str>) -> BrokerResult<()> {
        let version = header.unwrap_or(DEFAULT_API_VERSION);
        if compare_versions(version, &self.min_api_version).is_ge() {
            Ok(())
        } else {
            Err(BrokerError::PreconditionFailed {
                message: format!(
                    "At least Broker API version {} is required.",
                    self.min_api_version
                ),
            })
        }
    }

    /// `<protocol>://<host>/manage/dashboards/<manager>/instances/<id>`.
    pub fn dashboard_url(&self, plan: &Plan, instance_id: &str) -> Option<String> {
        self.dashboard.as_ref().map(|(protocol, host)| {
            format!(
                "{protocol}://{host}/manage/dashboards/{}/instances/{instance_id}",
                plan.manager
            )
        })
    }

    // ---- provision -------------------------------------------------------

    pub async fn provision(&self, req: ProvisionRequest) -> BrokerResult<BrokerResponse> {
        let plan = self.catalog.plan(&req.plan_id)?;
        let id = req.instance_id.clone();
        self.guarded(&id, OperationType::Create, || self.do_provision(&req, &plan))
            .await
            .inspect_err(|e| self.failed(&id, OperationType::Create.as_str(), e))
    }

    async fn do_provision(
        &self,
        req: &ProvisionRequest,
        plan: &Plan,
    ) -> BrokerResult<BrokerResponse> {
        let target = self.instance_ref(plan, &req.instance_id);
        let create = NewResource::new(target.clone())
            .spec(self.spec_payload(&req.params, &req.plan_id))
            .state(ResourceState::InQueue);
        match self.client.create(create).await {
            Ok(_) => {}
            Err(BrokerError::Conflict { message }) => {
                debug!(instance = %req.instance_id, %message, "provision conflict");
                return Ok(BrokerResponse::conflict());
            }
            Err(e) => return Err(e),
        }
        self.accepted(&req.instance_id, OperationType::Create.as_str());

        let mut body = Map::new();
        if let Some(url) = self.dashboard_url(plan, &req.instance_id) {
            body.insert("dashboard_url".into(), Value::from(url));
        }
        if plan.asynchronous {
            body.insert(
                "operation".into(),
                Value::from(OperationToken::new(OperationType::Create).encode()?),
            );
            return Ok(BrokerResponse::accepted(body));
        }

        let outcome = self.poller.await_terminal(&target, ResourceState::InQueue).await?;
        self.completed(&req.instance_id, OperationType::Create.as_str(), &outcome);
        Ok(BrokerResponse::created(body))
    }

    // ---- update ----------------------------------------------------------

    /// Updates an instance, or starts a service flow when the request names one.
    ///
    /// An illegal plan transition fails with `BadRequest` before any lock or
    /// store write.
    pub async fn update(&self, req: UpdateRequest) -> BrokerResult<BrokerResponse> {
        let plan = self.catalog.plan(&req.plan_id)?;
        if let Some(previous) = &req.previous_plan_id {
            if !plan.allows_update_from(previous) {
                return Err(BrokerError::bad_request(format!(
                    "Update to plan '{}' is not possible",
                    plan.name
                )));
            }
        }
        let id = req.instance_id.clone();
        self.guarded(&id, OperationType::Update, || self.do_update(&req, &plan))
            .await
            .inspect_err(|e| self.failed(&id, OperationType::Update.as_str(), e))
    }

    async fn do_update(&self, req: &UpdateRequest, plan: &Plan) -> BrokerResult<BrokerResponse> {
        let (target, start) = match &req.service_flow {
            Some(flow) => {
                let target = self.flow_ref(&flow.id);
                let options = json!({
                    "serviceflow_name": flow.name,
                    "instance_id": req.instance_id,
                    "operation_params": req.params,
                    "user": req.user.clone().unwrap_or(Value::Null),
                });
                let status = json!({"state": ResourceState::InQueue.as_str(), "lastOperation": {}, "response": {}});
                self.client
                    .create(
                        NewResource::new(target.clone())
                            .label(INSTANCE_LABEL, req.instance_id.as_str())
                            .spec_field("options", options)
                            .status(into_map(status)),
                    )
                    .await?;
                (target, ResourceState::InQueue)
            }
            None => {
                let target = self.instance_ref(plan, &req.instance_id);
                let patch = ResourcePatch::new()
                    .spec(self.spec_payload(&req.params, &req.plan_id))
                    .state(ResourceState::Update)
                    .status_field("description", Value::from(""));
                self.client.patch(&target, patch).await?;
                (target, ResourceState::Update)
            }
        };
        self.accepted(&req.instance_id, OperationType::Update.as_str());

        let mut body = Map::new();
        if let Some(url) = self.dashboard_url(plan, &req.instance_id) {
            body.insert("dashboard_url".into(), Value::from(url));
        }
        if plan.asynchronous {
            let mut token = OperationToken::new(OperationType::Update);
            if let Some(flow) = &req.service_flow {
                token = token.with_service_flow(&flow.name, &flow.id);
            }
            body.insert("operation".into(), Value::from(token.encode()?));
            return Ok(BrokerResponse::accepted(body));
        }

        let outcome = self.poller.await_terminal(&target, start).await?;
        if let Some(description) = outcome
            .response
            .as_ref()
            .and_then(|r| r.get("description"))
            .filter(|d| !d.is_null())
        {
            body.insert("description".into(), description.clone());
        }
        self.completed(&req.instance_id, OperationType::Update.as_str(), &outcome);
        Ok(BrokerResponse::ok(body))
    }

    // ---- deprovision -----------------------------------------------------

    pub async fn deprovision(&self, req: DeprovisionRequest) -> BrokerResult<BrokerResponse> {
        let plan = self.catalog.plan(&req.plan_id)?;
        let id = req.instance_id.clone();
        self.guarded(&id, OperationType::Delete, || self.do_deprovision(&req, &plan))
            .await
            .inspect_err(|e| self.failed(&id, OperationType::Delete.as_str(), e))
    }

    async fn do_deprovision(
        &self,
        req: &DeprovisionRequest,
        plan: &Plan,
    ) -> BrokerResult<BrokerResponse> {
        let target = self.instance_ref(plan, &req.instance_id);
        let patch = ResourcePatch::new()
            .spec(self.spec_payload(&req.params, &req.plan_id))
            .state(ResourceState::Delete)
            .status_field("description", Value::from(""));
        match self.client.patch(&target, patch).await {
            Ok(_) => {}
            Err(BrokerError::NotFound { .. }) => return Ok(BrokerResponse::gone()),
            Err(e) => return Err(e),
        }
        self.accepted(&req.instance_id, OperationType::Delete.as_str());

        if plan.asynchronous {
            let mut body = Map::new();
            body.insert(
                "operation".into(),
                Value::from(OperationToken::new(OperationType::Delete).encode()?),
            );
            return Ok(BrokerResponse::accepted(body));
        }

        match self.poller.await_terminal(&target, ResourceState::Delete).await {
            Ok(outcome) => {
                self.completed(&req.instance_id, OperationType::Delete.as_str(), &outcome)
            }
            // The operator removed the object once it finished deleting.
            Err(BrokerError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(BrokerResponse::ok(Map::new()))
    }

    // ---- bind / unbind ---------------------------------------------------

    pub async fn bind(&self, req: BindRequest) -> BrokerResult<BrokerResponse> {
        self.do_bind(&req)
            .await
            .inspect_err(|e| self.failed(&req.binding_id, "bind", e))
    }

    async fn do_bind(&self, req: &BindRequest) -> BrokerResult<BrokerResponse> {
        let plan = self.catalog.plan(&req.plan_id)?;
        self.reject_if_write_locked(&req.instance_id).await?;

        let target = self.binding_ref(&plan, &req.instance_id, &req.binding_id);
        let create = NewResource::new(target.clone())
            .label(INSTANCE_LABEL, req.instance_id.as_str())
            .spec(binding_spec(&req.params, &req.instance_id, &req.binding_id))
            .state(ResourceState::InQueue);
        match self.client.create(create).await {
            Ok(_) => {}
            Err(BrokerError::Conflict { message }) => {
                debug!(binding = %req.binding_id, %message, "binding already exists");
                return Ok(BrokerResponse::conflict());
            }
            Err(e) => return Err(e),
        }
        self.accepted(&req.binding_id, "bind");

        let outcome = self.poller.await_terminal(&target, ResourceState::InQueue).await?;
        let credentials = match &outcome.response {
            Some(Value::String(encoded)) => decode_base64_json(encoded)?,
            Some(Value::Object(response)) => response
                .get("credentials")
                .cloned()
                .unwrap_or_else(|| Value::Object(response.clone())),
            _ => json!({}),
        };
        self.completed(&req.binding_id, "bind", &outcome);

        let mut body = Map::new();
        body.insert("credentials".into(), credentials);
        Ok(BrokerResponse::created(body))
    }

    pub async fn unbind(&self, req: UnbindRequest) -> BrokerResult<BrokerResponse> {
        match self.do_unbind(&req).await {
            Err(BrokerError::NotFound { .. }) => Ok(BrokerResponse::gone()),
            other => other.inspect_err(|e| self.failed(&req.binding_id, "unbind", e)),
        }
    }

    async fn do_unbind(&self, req: &UnbindRequest) -> BrokerResult<BrokerResponse> {
        let plan = self.catalog.plan(&req.plan_id)?;
        self.reject_if_write_locked(&req.instance_id).await?;

        let target = self.binding_ref(&plan, &req.instance_id, &req.binding_id);
        let spec = binding_spec(&req.params, &req.instance_id, &req.binding_id);
        let patch = ResourcePatch::new()
            .spec(spec.clone())
            .state(ResourceState::Delete);
        match self.client.patch(&target, patch).await {
            Ok(_) => {}
            Err(BrokerError::NotFound { .. }) => {
                debug!(binding = %req.binding_id, "binding not found, creating it in delete state");
                self.client
                    .create(
                        NewResource::new(target.clone())
                            .label(INSTANCE_LABEL, req.instance_id.as_str())
                            .spec(spec)
                            .state(ResourceState::Delete),
                    )
                    .await?;
            }
            Err(e) => return Err(e),
        }
        self.accepted(&req.binding_id, "unbind");

        let outcome = self.poller.await_terminal(&target, ResourceState::Delete).await?;
        self.client.delete(&target).await?;
        self.completed(&req.binding_id, "unbind", &outcome);
        Ok(BrokerResponse::ok(Map::new()))
    }

    // ---- last operation --------------------------------------------------

    /// Reports the state of the operation described by the request's token.
    ///
    /// In locked deployments the instance lock is released once the
    /// operation is observed finished (succeeded, failed or gone).
    pub async fn last_operation(&self, req: LastOperationRequest) -> BrokerResult<BrokerResponse> {
        let token = match req.operation.as_deref() {
            Some(encoded) => OperationToken::decode(encoded)?,
            None => OperationToken::default(),
        };
        let (target, instance_type) = match &token.serviceflow_id {
            Some(flow_id) => (self.flow_ref(flow_id), "service flow"),
            None => {
                let target = match (self.capabilities.addressing, req.plan_id.as_deref()) {
                    (Addressing::Osb, _) => osb_instance_ref(&req.instance_id),
                    (Addressing::Plan, Some(plan_id)) => {
                        self.instance_ref(&self.catalog.plan(plan_id)?, &req.instance_id)
                    }
                    (Addressing::Plan, None) => {
                        return Err(BrokerError::bad_request("plan_id is required"))
                    }
                };
                (target, "service instance")
            }
        };

        match self.client.get_status(&target).await {
            Ok(view) => {
                let state = view
                    .state
                    .as_deref()
                    .map(external_state)
                    .unwrap_or(IN_PROGRESS);
                if state == SUCCEEDED || state == FAILED {
                    self.release(&req.instance_id).await;
                }
                let mut body = Map::new();
                body.insert("state".into(), Value::from(state));
                if let Some(description) = view.description {
                    body.insert("description".into(), Value::from(description));
                }
                Ok(BrokerResponse::ok(body))
            }
            Err(BrokerError::NotFound { message }) => {
                self.release(&req.instance_id).await;
                if token.is_delete() {
                    return Ok(BrokerResponse::gone());
                }
                let action = token
                    .operation_type
                    .as_ref()
                    .map_or("Operation", OperationType::action);
                let mut body = Map::new();
                body.insert("state".into(), Value::from(FAILED));
                body.insert(
                    "description".into(),
                    Value::from(format!(
                        "{action} {instance_type} '{}' failed because \"{message}\"",
                        req.instance_id
                    )),
                );
                Ok(BrokerResponse::ok(body))
            }
            Err(e) => Err(e),
        }
    }

    // ---- helpers ---------------------------------------------------------

    /// Runs `run` under the instance WRITE lock in locked deployments.
    ///
    /// A lock conflict is returned untouched. Any result other than
    /// `202 Accepted` releases the lock before returning. If the returned
    /// future is dropped before that, [`LockRelease`] unlocks on a spawned task.
    async fn guarded<F, Fut>(
        &self,
        instance_id: &str,
        operation: OperationType,
        run: F,
    ) -> BrokerResult<BrokerResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<BrokerResponse>>,
    {
        let Some(locks) = &self.locks else {
            return run().await;
        };
        locks.lock(instance_id, operation.as_str()).await?;
        let mut pending = LockRelease::new(locks.clone(), instance_id);

        let result = run().await;
        if !matches!(&result, Ok(r) if r.is_accepted()) {
            self.release(instance_id).await;
        }
        pending.disarm();
        result
    }

    async fn release(&self, instance_id: &str) {
        if let Some(locks) = &self.locks {
            if let Err(e) = locks.unlock(instance_id).await {
                warn!(instance = instance_id, error = %e, "failed to release instance lock");
            }
        }
    }

    async fn reject_if_write_locked(&self, instance_id: &str) -> BrokerResult<()> {
        let Some(locks) = &self.locks else {
            return Ok(());
        };
        let status = locks.check_write_lock_status(instance_id).await?;
        if !status.is_write_locked {
            return Ok(());
        }
        let holder = status.details.as_ref().and_then(|d| d.holder());
        Err(BrokerError::LockConflict {
            name: instance_id.to_string(),
            message: match holder {
                Some(op) => format!("Resource {instance_id} is write locked for {op}"),
                None => format!("Resource {instance_id} is write locked"),
            },
        })
    }

    fn instance_ref(&self, plan: &Plan, instance_id: &str) -> ResourceRef {
        match self.capabilities.addressing {
            Addressing::Osb => osb_instance_ref(instance_id),
            Addressing::Plan => {
                ResourceRef::new(&plan.resource_group, &plan.resource_type, instance_id)
            }
        }
    }

    /// Bindings live in their instance's namespace.
    fn binding_ref(&self, plan: &Plan, instance_id: &str, binding_id: &str) -> ResourceRef {
        let target = match self.capabilities.addressing {
            Addressing::Osb => ResourceRef::new(OSB_GROUP, BINDING_KIND, binding_id),
            Addressing::Plan => {
                ResourceRef::new(&plan.bind_resource_group, &plan.bind_resource_type, binding_id)
            }
        };
        target.in_namespace(self.client.namespace_for(instance_id))
    }

    fn flow_ref(&self, flow_id: &str) -> ResourceRef {
        ResourceRef::new(SERVICE_FLOW_GROUP, SERIAL_SERVICE_FLOW_KIND, flow_id)
            .in_namespace(self.client.default_namespace())
    }

    fn spec_payload(&self, params: &Map<String, Value>, plan_id: &str) -> Map<String, Value> {
        let mut params = params.clone();
        params
            .entry("plan_id")
            .or_insert_with(|| Value::from(plan_id));
        match self.capabilities.addressing {
            Addressing::Osb => params,
            Addressing::Plan => {
                let mut spec = Map::new();
                spec.insert("options".into(), Value::Object(params));
                spec
            }
        }
    }

    fn accepted(&self, resource: &str, operation: &str) {
        self.bus.publish(
            Event::new(EventKind::OperationAccepted)
                .with_resource(resource)
                .with_operation(operation),
        );
    }

    fn completed(&self, resource: &str, operation: &str, outcome: &OperationOutcome) {
        self.bus.publish(
            Event::new(EventKind::OperationCompleted)
                .with_resource(resource)
                .with_operation(operation)
                .with_state(outcome.state.as_str()),
        );
    }

    fn failed(&self, resource: &str, operation: &str, err: &BrokerError) {
        self.bus.publish(
            Event::new(EventKind::OperationFailed)
                .with_resource(resource)
                .with_operation(operation)
                .with_reason(format!("{}: {}", err.as_label(), err.as_message())),
        );
    }
}

fn osb_instance_ref(instance_id: &str) -> ResourceRef {
    ResourceRef::new(OSB_GROUP, INSTANCE_KIND, instance_id)
}

fn binding_spec(params: &Map<String, Value>, instance_id: &str, binding_id: &str) -> Map<String, Value> {
    let mut spec = params.clone();
    spec.insert("binding_id".into(), Value::from(binding_id));
    spec.insert("id".into(), Value::from(binding_id));
    spec.insert("instance_id".into(), Value::from(instance_id));
    spec
}

/// Unlocks the instance when dropped while still armed.
///
/// Covers a verb future dropped mid-wait (client gone, request timeout).
struct LockRelease {
    locks: LockManager,
    instance_id: String,
    armed: bool,
}

impl LockRelease {
    fn new(locks: LockManager, instance_id: &str) -> Self {
        Self {
            locks,
            instance_id: instance_id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let instance_id = std::mem::take(&mut self.instance_id);
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(instance = %instance_id, "no runtime left to release instance lock");
            return;
        };
        let locks = self.locks.clone();
        rt.spawn(async move {
            match locks.unlock(&instance_id).await {
                Ok(()) => debug!(instance = %instance_id, "released lock of abandoned operation"),
                Err(e) => {
                    warn!(instance = %instance_id, error = %e, "failed to release instance lock")
                }
            }
        });
    }
}

/// Collapses internal states onto the protocol's three operation states.
fn external_state(state: &str) -> &str {
    match state {
        "in_queue" | "in_progress" | "update" | "delete" => IN_PROGRESS,
        "succeeded" => SUCCEEDED,
        "failed" | "delete_failed" => FAILED,
        other => other,
    }
}

/// Numeric `major.minor[.patch]` comparison; missing parts count as zero.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|o| o.is_ne())
        .unwrap_or(std::cmp::Ordering::Equal)
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DashboardConfig, LockMode};
    use crate::controller::catalog::StaticCatalog;
    use crate::lock::MemoryLockBackend;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    fn controller(cfg: BrokerConfig) -> BrokerController {
        let bus = Bus::new(64);
        let client = ResourceClient::new(Arc::new(MemoryBackend::default()), &cfg);
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()), &cfg, bus.clone());
        let catalog = StaticCatalog::new([
            Plan::new("small", "small").manager("postgresql"),
            Plan::new("large", "large").update_predecessors(["small"]),
            Plan::new("async", "async").asynchronous(true),
        ]);
        BrokerController::new(client, locks, Arc::new(catalog), &cfg, bus)
    }

    #[test]
    fn test_version_comparison() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_versions("2.12", "2.12"), Equal);
        assert_eq!(compare_versions("2.13", "2.12"), Greater);
        assert_eq!(compare_versions("2.9", "2.12"), Less);
        assert_eq!(compare_versions("2.12.1", "2.12"), Greater);
        assert_eq!(compare_versions("3", "2.12"), Greater);
    }

    #[test]
    fn test_api_version_check() {
        let c = controller(BrokerConfig::default());
        assert!(c.check_api_version(Some("2.14")).is_ok());
        let err = c.check_api_version(None).unwrap_err();
        assert_eq!(err.status_code(), 412);
        assert_eq!(
            err.as_message(),
            "At least Broker API version 2.12 is required."
        );
    }

    #[test]
    fn test_dashboard_url() {
        let c = controller(BrokerConfig {
            dashboard: Some(DashboardConfig {
                protocol: "https".into(),
                host: "broker.example.com".into(),
            }),
            ..BrokerConfig::default()
        });
        let plan = Plan::new("small", "small").manager("postgresql");
        assert_eq!(
            c.dashboard_url(&plan, "i1").as_deref(),
            Some("https://broker.example.com/manage/dashboards/postgresql/instances/i1")
        );
        assert!(controller(BrokerConfig::default())
            .dashboard_url(&plan, "i1")
            .is_none());
    }

    #[test]
    fn test_external_state_mapping() {
        assert_eq!(external_state("in_queue"), IN_PROGRESS);
        assert_eq!(external_state("update"), IN_PROGRESS);
        assert_eq!(external_state("succeeded"), SUCCEEDED);
        assert_eq!(external_state("delete_failed"), FAILED);
    }

    #[tokio::test]
    async fn test_illegal_update_writes_nothing() {
        let c = controller(BrokerConfig::default());
        let err = c
            .update(UpdateRequest::new("i1", "large").from_plan("medium"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BrokerError::bad_request("Update to plan 'large' is not possible")
        );
        let missing = c.client.get(&osb_instance_ref("i1")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_plan_addressing_wraps_params_in_options() {
        let c = controller(BrokerConfig {
            capabilities: Capabilities {
                locking: LockMode::Lockless,
                addressing: Addressing::Plan,
            },
            ..BrokerConfig::default()
        });
        let res = c
            .provision(ProvisionRequest::new("i9", "async").param("parameters", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(res.status, 202);

        let stored = c.client.get(&osb_instance_ref("i9")).await.unwrap();
        assert_eq!(stored.spec["options"]["parameters"], json!({"a": 1}));
        assert_eq!(stored.spec["options"]["plan_id"], json!("async"));
    }

    #[tokio::test]
    async fn test_last_operation_without_resource() {
        let c = controller(BrokerConfig {
            poll_interval: Duration::from_millis(5),
            ..BrokerConfig::default()
        });
        let create = OperationToken::new(OperationType::Create).encode().unwrap();
        let res = c
            .last_operation(LastOperationRequest::new("i7").operation(create))
            .await
            .unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body["state"], json!("failed"));
        let description = res.body["description"].as_str().unwrap();
        assert!(description.starts_with("Create service instance 'i7' failed because \""));

        let delete = OperationToken::new(OperationType::Delete).encode().unwrap();
        let res = c
            .last_operation(LastOperationRequest::new("i7").operation(delete))
            .await
            .unwrap();
        assert_eq!(res.status, 410);
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let c = controller(BrokerConfig::default());
        let err = c
            .last_operation(LastOperationRequest::new("i1").operation("!!"))
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "invalid_token");
    }
}
