//! # Synchronous operation wait.
//!
//! [`OperationPoller::await_terminal`] turns an asynchronous state change in the
//! store into a synchronous-looking result:
//!
//! ```text
//! loop:
//!   sleep(poll_interval) ─► get(resource)
//!      ├─ state == start_state ─► elapsed > timeout ? Timeout : loop
//!      ├─ failed | delete_failed ─► Err(status.error mapped to BrokerError)
//!      └─ any other state ─► Ok { state, response }
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{Bus, Event, EventKind};
use crate::store::{ResourceClient, ResourceRef, ResourceState};

/// Terminal (or at least post-start) observation of a resource.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationOutcome {
    pub state: ResourceState,
    pub response: Option<Value>,
}

/// Polls a resource until it leaves its start state.
#[derive(Clone)]
pub struct OperationPoller {
    client: ResourceClient,
    bus: Bus,
    interval: Duration,
    timeout: Option<Duration>,
}

impl OperationPoller {
    pub fn new(client: ResourceClient, cfg: &BrokerConfig, bus: Bus) -> Self {
        Self {
            client,
            bus,
            interval: cfg.poll_interval,
            timeout: cfg.operation_timeout(),
        }
    }

    /// Waits until `target` is no longer in `start_state`.
    ///
    /// Store errors (including `NotFound` once an operator has removed the
    /// object) propagate unchanged.
    pub async fn await_terminal(
        &self,
        target: &ResourceRef,
        start_state: ResourceState,
    ) -> BrokerResult<OperationOutcome> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.interval).await;
            let resource = self.client.get(target).await?;

            let state = resource.state().ok_or_else(|| {
                BrokerError::internal(format!(
                    "{} has no recognizable state ({:?})",
                    target,
                    resource.state_str()
                ))
            })?;

            if state == start_state {
                let elapsed = started.elapsed();
                if let Some(timeout) = self.timeout {
                    if elapsed > timeout {
                        self.bus.publish(
                            Event::new(EventKind::TimeoutHit)
                                .with_resource(target.id.as_str())
                                .with_state(start_state.as_str())
                                .with_timeout(timeout)
                                .with_elapsed(elapsed),
                        );
                        return Err(BrokerError::Timeout {
                            timeout,
                            message: format!(
                                "{} with guid {} not yet processed",
                                target.group, target.id
                            ),
                        });
                    }
                }
                continue;
            }

            if state.is_failure() {
                return Err(match resource.status_field("error") {
                    Some(err) if !err.is_null() => error_from_payload(err),
                    _ => BrokerError::internal(format!(
                        "{} reached state '{}' without error details",
                        target, state
                    )),
                });
            }

            return Ok(OperationOutcome {
                state,
                response: resource.status_field("response").cloned(),
            });
        }
    }
}

/// Maps an operator-reported `status.error` document onto the taxonomy.
///
/// The status code is read from `code`, `status` or `statusCode`; the message
/// from `message` or `description`. A bare string is an internal error.
pub fn error_from_payload(err: &Value) -> BrokerError {
    let Some(obj) = err.as_object() else {
        let message = err
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| err.to_string());
        return BrokerError::internal(message);
    };

    let code = ["code", "status", "statusCode"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .and_then(|c| u16::try_from(c).ok());
    let message = ["message", "description"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(String::from)
        .unwrap_or_else(|| err.to_string());

    match code {
        Some(code) => BrokerError::from_status(code, message),
        None => BrokerError::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, NewResource, ResourcePatch};
    use serde_json::json;
    use std::sync::Arc;

    fn setup(interval_ms: u64, timeout_ms: u64) -> (ResourceClient, OperationPoller) {
        let cfg = BrokerConfig {
            poll_interval: Duration::from_millis(interval_ms),
            operation_timeout: Duration::from_millis(timeout_ms),
            ..BrokerConfig::default()
        };
        let client = ResourceClient::new(Arc::new(MemoryBackend::default()), &cfg);
        let poller = OperationPoller::new(client.clone(), &cfg, Bus::new(16));
        (client, poller)
    }

    fn target() -> ResourceRef {
        ResourceRef::new("osb.servicefabrik.io", "sfserviceinstances", "i1")
    }

    #[tokio::test]
    async fn test_stuck_in_queue_times_out() {
        let (client, poller) = setup(50, 200);
        client
            .create(NewResource::new(target()).state(ResourceState::InQueue))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = poller
            .await_terminal(&target(), ResourceState::InQueue)
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "timeout");
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_returns_state_and_response() {
        let (client, poller) = setup(10, 1_000);
        client
            .create(NewResource::new(target()).state(ResourceState::InQueue))
            .await
            .unwrap();

        let c = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            c.patch(
                &target(),
                ResourcePatch::new()
                    .state(ResourceState::Succeeded)
                    .status_field("response", json!({"dashboard": "x"})),
            )
            .await
            .unwrap();
        });

        let out = poller
            .await_terminal(&target(), ResourceState::InQueue)
            .await
            .unwrap();
        assert_eq!(out.state, ResourceState::Succeeded);
        assert_eq!(out.response, Some(json!({"dashboard": "x"})));
    }

    #[tokio::test]
    async fn test_failed_state_surfaces_operator_error() {
        let (client, poller) = setup(10, 1_000);
        client
            .create(
                NewResource::new(target())
                    .state(ResourceState::Failed)
                    .status(
                        json!({"state": "failed", "error": {"code": 409, "message": "quota"}})
                            .as_object()
                            .cloned()
                            .unwrap(),
                    ),
            )
            .await
            .unwrap();

        let err = poller
            .await_terminal(&target(), ResourceState::InQueue)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::conflict("quota"));
    }

    #[test]
    fn test_error_payload_mapping() {
        assert_eq!(
            error_from_payload(&json!({"status": 404, "description": "gone"})).as_label(),
            "not_found"
        );
        assert_eq!(
            error_from_payload(&json!({"code": 504, "message": "slow"})).as_label(),
            "timeout"
        );
        assert_eq!(error_from_payload(&json!("boom")), BrokerError::internal("boom"));
        assert_eq!(
            error_from_payload(&json!({"message": "no code"})).as_label(),
            "internal"
        );
    }
}
