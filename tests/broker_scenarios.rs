use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use brokervisor::{
    Addressing, BindRequest, Broker, BrokerConfig, BrokerError, BrokerResult, Capabilities,
    DeprovisionRequest, ExternalStatus, LastOperationRequest, LockMode, NewResource,
    OperationSource, OperationToken, OperationType, Plan, ProvisionRequest, Resource,
    ResourceClient, ResourcePatch, ResourceRef, ResourceState, StaticCatalog, UnbindRequest,
    UpdateRequest, BINDING_KIND, INSTANCE_KIND, OSB_GROUP,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new([
        Plan::new("sync-plan", "sync-plan"),
        Plan::new("async-plan", "async-plan").asynchronous(true),
        Plan::new("large-plan", "large-plan").update_predecessors(["sync-plan"]),
    ])
}

fn cfg(locking: LockMode) -> BrokerConfig {
    BrokerConfig {
        poll_interval: Duration::from_millis(10),
        operation_timeout: Duration::from_secs(2),
        capabilities: Capabilities {
            locking,
            addressing: Addressing::Osb,
        },
        ..BrokerConfig::default()
    }
}

fn broker(cfg: BrokerConfig) -> Arc<Broker> {
    init_tracing();
    Broker::builder(cfg)
        .with_catalog(Arc::new(catalog()))
        .build()
}

fn instance(id: &str) -> ResourceRef {
    ResourceRef::new(OSB_GROUP, INSTANCE_KIND, id)
}

/// Scripted operator: finishes queued work unless the id starts with `fail-`
/// or `stuck-`. Instances in `delete` are removed, except `undeletable-` ones
/// which end in `delete_failed`; bindings in `delete` are marked succeeded and
/// left for the broker to remove.
fn spawn_operator(client: ResourceClient) -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        while !stop.is_cancelled() {
            let work = client
                .list_by_state(OSB_GROUP, INSTANCE_KIND, &[ResourceState::InQueue, ResourceState::Update])
                .await
                .unwrap_or_default();
            for r in work {
                let patch = if r.id().starts_with("stuck-") {
                    continue;
                } else if r.id().starts_with("fail-") {
                    ResourcePatch::new()
                        .state(ResourceState::Failed)
                        .status_field("error", json!({"code": 400, "message": "invalid parameters"}))
                } else {
                    ResourcePatch::new()
                        .state(ResourceState::Succeeded)
                        .status_field("response", json!({"description": "done"}))
                };
                let _ = client.patch(&r.reference(), patch).await;
            }

            let deleting = client
                .list_by_state(OSB_GROUP, INSTANCE_KIND, &[ResourceState::Delete])
                .await
                .unwrap_or_default();
            for r in deleting {
                if r.id().starts_with("undeletable-") {
                    let patch = ResourcePatch::new()
                        .state(ResourceState::DeleteFailed)
                        .status_field("error", json!({"code": 409, "message": "backup in progress"}));
                    let _ = client.patch(&r.reference(), patch).await;
                } else {
                    let _ = client.delete(&r.reference()).await;
                }
            }

            let bindings = client
                .list_by_state(OSB_GROUP, BINDING_KIND, &[ResourceState::InQueue, ResourceState::Delete])
                .await
                .unwrap_or_default();
            for r in bindings {
                let credentials = STANDARD.encode(json!({"username": r.id(), "password": "secret"}).to_string());
                let patch = ResourcePatch::new()
                    .state(ResourceState::Succeeded)
                    .status_field("response", json!(credentials));
                let _ = client.patch(&r.reference(), patch).await;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    token
}

#[tokio::test]
async fn test_sync_provision_returns_created_without_token() {
    let broker = broker(cfg(LockMode::Lockless));
    let client = broker.controller().client().clone();
    let operator = spawn_operator(client.clone());

    let res = broker
        .controller()
        .provision(ProvisionRequest::new("i1", "sync-plan").param("parameters", json!({"size": 1})))
        .await
        .unwrap();
    assert_eq!(res.status, 201);
    assert!(res.operation().is_none());

    let stored = client.get(&instance("i1")).await.unwrap();
    assert_eq!(stored.state(), Some(ResourceState::Succeeded));
    assert_eq!(stored.labels()["state"], "succeeded");
    assert_eq!(stored.spec["parameters"], json!({"size": 1}));
    operator.cancel();
}

#[tokio::test]
async fn test_async_provision_returns_decodable_token() {
    let broker = broker(cfg(LockMode::Lockless));

    let res = broker
        .controller()
        .provision(ProvisionRequest::new("i2", "async-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 202);
    let token = OperationToken::decode(res.operation().unwrap()).unwrap();
    assert_eq!(token, OperationToken::new(OperationType::Create));

    let last = broker
        .controller()
        .last_operation(LastOperationRequest::new("i2").operation(res.operation().unwrap()))
        .await
        .unwrap();
    assert_eq!(last.body["state"], json!("in progress"));
}

#[tokio::test]
async fn test_duplicate_provision_is_conflict() {
    let broker = broker(cfg(LockMode::Lockless));
    let c = broker.controller();
    assert_eq!(c.provision(ProvisionRequest::new("i3", "async-plan")).await.unwrap().status, 202);
    assert_eq!(c.provision(ProvisionRequest::new("i3", "async-plan")).await.unwrap().status, 409);
}

#[tokio::test]
async fn test_bind_twice_is_conflict() {
    let broker = broker(cfg(LockMode::Lockless));
    let operator = spawn_operator(broker.controller().client().clone());
    let c = broker.controller();
    c.provision(ProvisionRequest::new("i1", "sync-plan")).await.unwrap();

    let first = c.bind(BindRequest::new("i1", "b1", "sync-plan")).await.unwrap();
    assert_eq!(first.status, 201);
    assert_eq!(
        first.body["credentials"],
        json!({"username": "b1", "password": "secret"})
    );

    let second = c.bind(BindRequest::new("i1", "b1", "sync-plan")).await.unwrap();
    assert_eq!(second.status, 409);
    operator.cancel();
}

#[tokio::test]
async fn test_bind_then_unbind_removes_binding() {
    let broker = broker(cfg(LockMode::Lockless));
    let client = broker.controller().client().clone();
    let operator = spawn_operator(client.clone());
    let c = broker.controller();
    c.provision(ProvisionRequest::new("i9", "sync-plan")).await.unwrap();
    assert_eq!(c.bind(BindRequest::new("i9", "b9", "sync-plan")).await.unwrap().status, 201);

    let binding = ResourceRef::new(OSB_GROUP, BINDING_KIND, "b9").in_namespace(client.namespace_for("i9"));
    let bound = client.get(&binding).await.unwrap();
    assert_eq!(bound.state(), Some(ResourceState::Succeeded));
    assert_eq!(bound.labels()["instance_guid"], "i9");

    let res = c.unbind(UnbindRequest::new("i9", "b9", "sync-plan")).await.unwrap();
    assert_eq!(res.status, 200);
    assert!(client.get(&binding).await.unwrap_err().is_not_found());
    operator.cancel();
}

#[tokio::test]
async fn test_unbind_of_unmaterialized_binding_cleans_up() {
    let broker = broker(cfg(LockMode::Lockless));
    let client = broker.controller().client().clone();
    let operator = spawn_operator(client.clone());

    let res = broker
        .controller()
        .unbind(UnbindRequest::new("i1", "ghost", "sync-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 200);

    let binding = ResourceRef::new(OSB_GROUP, BINDING_KIND, "ghost").in_namespace(client.namespace_for("i1"));
    assert!(client.get(&binding).await.unwrap_err().is_not_found());
    operator.cancel();
}

#[tokio::test]
async fn test_deprovision_missing_instance_is_gone() {
    let broker = broker(cfg(LockMode::Lockless));
    let res = broker
        .controller()
        .deprovision(DeprovisionRequest::new("nope", "sync-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 410);
}

#[tokio::test]
async fn test_sync_deprovision_completes_when_object_is_removed() {
    let broker = broker(cfg(LockMode::Lockless));
    let operator = spawn_operator(broker.controller().client().clone());
    let c = broker.controller();
    c.provision(ProvisionRequest::new("i4", "sync-plan")).await.unwrap();

    let res = c.deprovision(DeprovisionRequest::new("i4", "sync-plan")).await.unwrap();
    assert_eq!(res.status, 200);
    operator.cancel();
}

#[tokio::test]
async fn test_sync_deprovision_surfaces_delete_failure() {
    let broker = broker(cfg(LockMode::Locked));
    let client = broker.controller().client().clone();
    let operator = spawn_operator(client.clone());
    let c = broker.controller();
    c.provision(ProvisionRequest::new("undeletable-1", "sync-plan")).await.unwrap();

    let err = c
        .deprovision(DeprovisionRequest::new("undeletable-1", "sync-plan"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::conflict("backup in progress"));

    let stored = client.get(&instance("undeletable-1")).await.unwrap();
    assert_eq!(stored.state(), Some(ResourceState::DeleteFailed));

    // The failure released the lock.
    let err = c
        .deprovision(DeprovisionRequest::new("undeletable-1", "sync-plan"))
        .await
        .unwrap_err();
    assert!(!err.is_lock_conflict());
    operator.cancel();
}

#[tokio::test]
async fn test_illegal_update_leaves_instance_untouched() {
    let broker = broker(cfg(LockMode::Lockless));
    let client = broker.controller().client().clone();
    client
        .create(NewResource::new(instance("i5")).state(ResourceState::Succeeded))
        .await
        .unwrap();
    let before = client.get(&instance("i5")).await.unwrap();

    let err = broker
        .controller()
        .update(UpdateRequest::new("i5", "sync-plan").from_plan("large-plan"))
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "bad_request");

    let after = client.get(&instance("i5")).await.unwrap();
    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
}

#[tokio::test]
async fn test_sync_update_embeds_description() {
    let broker = broker(cfg(LockMode::Lockless));
    let operator = spawn_operator(broker.controller().client().clone());
    let c = broker.controller();
    c.provision(ProvisionRequest::new("i6", "sync-plan")).await.unwrap();

    let res = c
        .update(UpdateRequest::new("i6", "large-plan").from_plan("sync-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body["description"], json!("done"));
    operator.cancel();
}

#[tokio::test]
async fn test_service_flow_update_is_polled_through_flow_resource() {
    let broker = broker(cfg(LockMode::Lockless));
    let c = broker.controller();
    c.provision(ProvisionRequest::new("i7", "async-plan")).await.unwrap();

    let res = c
        .update(UpdateRequest::new("i7", "async-plan").service_flow("blueprint", "flow-1"))
        .await
        .unwrap();
    assert_eq!(res.status, 202);
    let token = OperationToken::decode(res.operation().unwrap()).unwrap();
    assert_eq!(token.serviceflow_id.as_deref(), Some("flow-1"));

    let last = c
        .last_operation(LastOperationRequest::new("i7").operation(res.operation().unwrap()))
        .await
        .unwrap();
    assert_eq!(last.body["state"], json!("in progress"));

    // The instance itself was not moved to `update`.
    let stored = c.client().get(&instance("i7")).await.unwrap();
    assert_eq!(stored.state(), Some(ResourceState::InQueue));
}

#[tokio::test]
async fn test_sync_wait_times_out() {
    let broker = broker(BrokerConfig {
        operation_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        ..cfg(LockMode::Locked)
    });

    let err = broker
        .controller()
        .provision(ProvisionRequest::new("stuck-1", "sync-plan"))
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "timeout");

    // The timeout released the lock.
    let res = broker
        .controller()
        .deprovision(DeprovisionRequest::new("stuck-1", "async-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 202);
}

#[tokio::test]
async fn test_abandoned_sync_wait_releases_lock() {
    let broker = broker(cfg(LockMode::Locked));
    let c = broker.controller();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        c.provision(ProvisionRequest::new("stuck-2", "sync-plan")),
    )
    .await;
    assert!(abandoned.is_err(), "provision should still be waiting");

    let mut status = None;
    for _ in 0..50 {
        match c.deprovision(DeprovisionRequest::new("stuck-2", "async-plan")).await {
            Ok(res) => {
                status = Some(res.status);
                break;
            }
            Err(e) if e.is_lock_conflict() => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(status, Some(202));
}

#[tokio::test]
async fn test_locked_async_operation_holds_lock_until_last_operation() {
    let broker = broker(cfg(LockMode::Locked));
    let client = broker.controller().client().clone();
    let c = broker.controller();

    let res = c.provision(ProvisionRequest::new("i8", "async-plan")).await.unwrap();
    assert_eq!(res.status, 202);
    let token = res.operation().unwrap().to_string();

    let err = c
        .update(UpdateRequest::new("i8", "async-plan"))
        .await
        .unwrap_err();
    assert!(err.is_lock_conflict());
    assert!(err.as_message().contains("write locked for create"));

    let err = c.bind(BindRequest::new("i8", "b8", "async-plan")).await.unwrap_err();
    assert!(err.is_lock_conflict());

    let last = c
        .last_operation(LastOperationRequest::new("i8").operation(token.as_str()))
        .await
        .unwrap();
    assert_eq!(last.body["state"], json!("in progress"));
    assert!(c.update(UpdateRequest::new("i8", "async-plan")).await.unwrap_err().is_lock_conflict());

    client
        .patch(&instance("i8"), ResourcePatch::new().state(ResourceState::Succeeded))
        .await
        .unwrap();
    let last = c
        .last_operation(LastOperationRequest::new("i8").operation(token.as_str()))
        .await
        .unwrap();
    assert_eq!(last.body["state"], json!("succeeded"));

    let res = c.update(UpdateRequest::new("i8", "async-plan")).await.unwrap();
    assert_eq!(res.status, 202);
}

#[tokio::test]
async fn test_locked_failure_releases_lock_and_surfaces_error() {
    let broker = broker(cfg(LockMode::Locked));
    let operator = spawn_operator(broker.controller().client().clone());
    let c = broker.controller();

    let err = c
        .provision(ProvisionRequest::new("fail-1", "sync-plan"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::bad_request("invalid parameters"));

    let res = c
        .deprovision(DeprovisionRequest::new("fail-1", "sync-plan"))
        .await
        .unwrap();
    assert_eq!(res.status, 200);
    operator.cancel();
}

#[tokio::test]
async fn test_api_version_gate() {
    let broker = broker(cfg(LockMode::Lockless));
    let err = broker.controller().check_api_version(Some("2.11")).unwrap_err();
    assert_eq!(err.status_code(), 412);
    assert!(broker.controller().check_api_version(Some("2.12")).is_ok());
}

struct CountingSource {
    polls: AtomicUsize,
}

#[async_trait]
impl OperationSource for CountingSource {
    async fn poll(&self, _resource: &Resource) -> BrokerResult<ExternalStatus> {
        if self.polls.fetch_add(1, Ordering::SeqCst) < 2 {
            Ok(ExternalStatus::InProgress { description: None })
        } else {
            Ok(ExternalStatus::Succeeded {
                response: json!({"restored": true}),
            })
        }
    }
}

#[tokio::test]
async fn test_broker_reconciles_in_background_and_shuts_down() {
    init_tracing();
    let source = Arc::new(CountingSource {
        polls: AtomicUsize::new(0),
    });
    let broker = Broker::builder(BrokerConfig {
        watcher_poll_interval: Duration::from_millis(10),
        watch_refresh_interval: Duration::from_millis(100),
        grace: Duration::from_secs(1),
        ..BrokerConfig::default()
    })
    .with_watcher(source.clone(), "restore.servicefabrik.io", "defaultrestores")
    .build();

    let client = broker.controller().client().clone();
    let target = ResourceRef::new("restore.servicefabrik.io", "defaultrestores", "r1");
    client
        .create(NewResource::new(target.clone()).state(ResourceState::InProgress))
        .await
        .unwrap();

    let runner = Arc::clone(&broker);
    let run = tokio::spawn(async move { runner.run_until(std::future::pending()).await });

    let mut reached = false;
    for _ in 0..200 {
        if client.get_state(&target).await.unwrap() == Some(ResourceState::Succeeded) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "restore never completed");
    assert_eq!(
        client.get_response(&target).await.unwrap(),
        Some(json!({"restored": true}))
    );

    broker.request_shutdown();
    run.await.unwrap().unwrap();
    assert!(broker.registry().is_empty().await);
}
