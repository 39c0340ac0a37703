//! # Demo: locked_lifecycle
//!
//! Runs an asynchronous provision against the in-memory store in a locked
//! deployment and shows how the instance lock brackets the operation.
//!
//! ## Flow
//! ```text
//! provision(i1, async) ──► lock(i1) ──► create(in_queue) ──► 202 + token
//! update(i1)           ──► LockRejected (write locked for create)
//! operator             ──► in_queue → in_progress → succeeded
//! last_operation(token) ─► "in progress" ... "succeeded" ──► unlock(i1)
//! update(i1)           ──► lock(i1) ──► patch(update) ──► 202
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=brokervisor=debug cargo run --example locked_lifecycle
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brokervisor::{
    Broker, BrokerConfig, Capabilities, Event, EventKind, LastOperationRequest, LockMode, Plan,
    ProvisionRequest, ResourcePatch, ResourceRef, ResourceState, StaticCatalog, Subscribe,
    UpdateRequest, INSTANCE_KIND, OSB_GROUP,
};

/// Counts rejected lock attempts.
#[derive(Default)]
struct LockAudit {
    rejected: AtomicUsize,
}

#[async_trait::async_trait]
impl Subscribe for LockAudit {
    async fn on_event(&self, ev: &Event) {
        if ev.kind == EventKind::LockRejected {
            let n = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            println!(
                "[audit] rejected #{n}: {} ({})",
                ev.resource.as_deref().unwrap_or("-"),
                ev.reason.as_deref().unwrap_or("-")
            );
        }
    }

    fn name(&self) -> &'static str {
        "lock-audit"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = BrokerConfig {
        poll_interval: Duration::from_millis(100),
        capabilities: Capabilities {
            locking: LockMode::Locked,
            ..Capabilities::default()
        },
        ..BrokerConfig::default()
    };
    let catalog = StaticCatalog::new([Plan::new("async-plan", "async-plan").asynchronous(true)]);

    let audit = Arc::new(LockAudit::default());
    let mut subs: Vec<Arc<dyn Subscribe>> = vec![audit.clone()];
    #[cfg(feature = "logging")]
    subs.push(Arc::new(brokervisor::LogWriter::new()));

    let broker = Broker::builder(cfg)
        .with_catalog(Arc::new(catalog))
        .with_subscribers(subs)
        .build();
    let controller = broker.controller();

    let accepted = controller
        .provision(ProvisionRequest::new("i1", "async-plan"))
        .await?;
    let token = accepted.operation().unwrap_or_default().to_string();
    println!("provision: {} token={token}", accepted.status);

    if let Err(e) = controller.update(UpdateRequest::new("i1", "async-plan")).await {
        println!("update while provisioning: {e}");
    }

    // Stand-in for the service operator.
    let client = controller.client().clone();
    tokio::spawn(async move {
        let target = ResourceRef::new(OSB_GROUP, INSTANCE_KIND, "i1");
        for state in [ResourceState::InProgress, ResourceState::Succeeded] {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = client
                .patch(&target, ResourcePatch::new().state(state))
                .await;
        }
    });

    loop {
        let last = controller
            .last_operation(LastOperationRequest::new("i1").operation(token.as_str()))
            .await?;
        println!("last_operation: {}", last.body);
        if last.body["state"] != "in progress" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    let res = controller.update(UpdateRequest::new("i1", "async-plan")).await?;
    println!("update after completion: {}", res.status);
    println!("lock rejections: {}", audit.rejected.load(Ordering::Relaxed));

    // Give subscriber workers a moment to drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
