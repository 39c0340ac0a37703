//! # Broker: wires the controller, background watchers and event fan-out.
//!
//! ```text
//! BrokerController ─┐
//! LockManager      ─┼─ publish(Event) ──► Bus ──► subscriber_listener ──► SubscriberSet
//! OperationWatcher ─┘
//!
//! run_until(stop):
//!   spawn OperationWatcher::run(child token) per configured watch
//!   stop resolves (signal, explicit request)
//!     └─► ShutdownRequested
//!     └─► runtime_token.cancel()  → watchers and pollers
//!     └─► PollerRegistry::cancel_all(grace) + join watchers before the same deadline
//!            ├─ all stopped → AllStoppedWithin
//!            └─ otherwise   → GraceExceeded, RuntimeError::GraceExceeded { stuck }
//! ```
//!
//! The controller is usable as soon as the broker is built; `run_until` only
//! drives background reconciliation.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BrokerConfig;
use crate::controller::BrokerController;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::poller::{OperationWatcher, PollerRegistry};
use crate::subscribers::SubscriberSet;

use super::builder::BrokerBuilder;
use super::shutdown;

/// Running broker instance.
pub struct Broker {
    cfg: BrokerConfig,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    controller: BrokerController,
    registry: Arc<PollerRegistry>,
    watchers: Vec<Arc<OperationWatcher>>,
    runtime_token: CancellationToken,
}

impl Broker {
    pub fn builder(cfg: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(cfg)
    }

    pub(super) fn new_internal(
        cfg: BrokerConfig,
        bus: Bus,
        subs: Arc<SubscriberSet>,
        controller: BrokerController,
        registry: Arc<PollerRegistry>,
        watchers: Vec<Arc<OperationWatcher>>,
        runtime_token: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            bus,
            subs,
            controller,
            registry,
            watchers,
            runtime_token,
        }
    }

    pub fn controller(&self) -> &BrokerController {
        &self.controller
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    /// Registry of background pollers, shared by all watchers.
    pub fn registry(&self) -> &Arc<PollerRegistry> {
        &self.registry
    }

    /// Makes a pending [`run_until`](Self::run_until) begin its shutdown.
    pub fn request_shutdown(&self) {
        self.runtime_token.cancel();
    }

    /// Forwards bus events to the subscriber set.
    pub(super) fn subscriber_listener(&self) {
        if self.subs.is_empty() {
            return;
        }
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber listener lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Runs background reconciliation until SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere).
    pub async fn run_until_shutdown(&self) -> Result<(), RuntimeError> {
        self.run_until(async {
            if let Err(e) = shutdown::termination_signal().await {
                warn!(error = %e, "signal registration failed, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        })
        .await
    }

    /// Runs background reconciliation until `stop` resolves or
    /// [`request_shutdown`](Self::request_shutdown) is called, then shuts down
    /// within the configured grace period.
    pub async fn run_until<F>(&self, stop: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .watchers
            .iter()
            .map(|w| {
                let token = self.runtime_token.child_token();
                (w.target(), tokio::spawn(Arc::clone(w).run(token)))
            })
            .collect();

        tokio::select! {
            _ = stop => {}
            _ = self.runtime_token.cancelled() => {}
        }
        self.shutdown(handles).await
    }

    async fn shutdown(&self, watchers: Vec<(String, JoinHandle<()>)>) -> Result<(), RuntimeError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();

        let grace = self.cfg.grace;
        let deadline = Instant::now() + grace;
        let mut stuck = self.registry.cancel_all(grace).await;
        for (name, handle) in watchers {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                stuck.push(format!("watch:{name}"));
            }
        }

        if stuck.is_empty() {
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            Ok(())
        } else {
            self.bus.publish(
                Event::new(EventKind::GraceExceeded)
                    .with_reason(stuck.join(","))
                    .with_timeout(grace),
            );
            Err(RuntimeError::GraceExceeded { grace, stuck })
        }
    }
}
