//! # LogWriter: renders runtime events as `tracing` records.
//!
//! Enabled with the `logging` feature (on by default). The host application
//! decides where the records go by installing a `tracing` subscriber.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO  brokervisor: accepted resource="i1" operation="create"
//! WARN  brokervisor: lock rejected resource="i1" operation="update" reason="Could not acquire lock"
//! WARN  brokervisor: timeout resource="i1" state="in_queue" timeout_ms=180000
//! INFO  brokervisor: poller stopped resource="i2" state="succeeded"
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let resource = e.resource.as_deref().unwrap_or("-");
        let operation = e.operation.as_deref().unwrap_or("-");
        let state = e.state.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("-");

        match e.kind {
            EventKind::OperationAccepted => {
                info!(target: "brokervisor", resource, operation, "accepted");
            }
            EventKind::OperationCompleted => {
                info!(target: "brokervisor", resource, operation, state, "completed");
            }
            EventKind::OperationFailed => {
                warn!(target: "brokervisor", resource, operation, reason, "failed");
            }
            EventKind::LockAcquired => {
                debug!(target: "brokervisor", resource, operation, "lock acquired");
            }
            EventKind::LockRejected => {
                warn!(target: "brokervisor", resource, operation, reason, "lock rejected");
            }
            EventKind::LockReleased => {
                debug!(target: "brokervisor", resource, "lock released");
            }
            EventKind::TimeoutHit => {
                warn!(target: "brokervisor", resource, state, timeout_ms = ?e.timeout_ms, "timeout");
            }
            EventKind::WatchEstablished => {
                info!(target: "brokervisor", resource, "watch established");
            }
            EventKind::WatchRefreshed => {
                debug!(target: "brokervisor", resource, "watch refreshed");
            }
            EventKind::WatchFailed => {
                warn!(target: "brokervisor", resource, reason, delay_ms = ?e.delay_ms, "watch failed");
            }
            EventKind::PollerStarted => {
                info!(target: "brokervisor", resource, "poller started");
            }
            EventKind::PollerTick => {
                debug!(target: "brokervisor", resource, state, reason, "poller tick");
            }
            EventKind::PollerStopped => {
                info!(target: "brokervisor", resource, state, elapsed_ms = ?e.elapsed_ms, "poller stopped");
            }
            EventKind::ShutdownRequested => {
                info!(target: "brokervisor", "shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!(target: "brokervisor", "all pollers stopped within grace");
            }
            EventKind::GraceExceeded => {
                error!(target: "brokervisor", reason, "grace exceeded");
            }
            EventKind::SubscriberOverflow => {
                warn!(target: "brokervisor", subscriber = resource, reason, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                error!(target: "brokervisor", subscriber = resource, reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
