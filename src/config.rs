//! # Broker runtime configuration.
//!
//! Provides [`BrokerConfig`] centralized settings for the store client, lock
//! manager, pollers and protocol controller.
//!
//! ## Sentinel values
//! - `operation_timeout = 0s` → wait forever in the synchronous poll
//! - `poller_max_lifetime = 0s` → background pollers run until terminal
//! - `lock_ttl = 0s` → lock details never expire on their own

use std::time::Duration;

use crate::policies::{BackoffPolicy, JitterPolicy};

/// Whether mutating verbs are bracketed by the instance write lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No advisory lock; conflicts surface only through the store.
    #[default]
    Lockless,
    /// Acquire a WRITE lock per instance before every mutating verb.
    Locked,
}

/// How instance and binding resources are addressed in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Interoperator OSB resources: fixed group/types, request body stored as `spec`.
    #[default]
    Osb,
    /// Plan-provided group/types, request body stored under `spec.options`.
    Plan,
}

/// Capability set that selects the controller variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Lock discipline.
    pub locking: LockMode,
    /// Resource coordinates.
    pub addressing: Addressing,
}

/// External location of the service dashboards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DashboardConfig {
    /// URL scheme (`https`).
    pub protocol: String,
    /// Host (and optional port).
    pub host: String,
}

/// Global configuration for the broker.
///
/// ## Notes
/// All fields are public for flexibility. Prefer using helper accessors to avoid
/// sprinkling sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Delay between status fetches while waiting for a resource to leave its start state.
    pub poll_interval: Duration,

    /// Wall-clock budget of the synchronous wait (`0s` = unbounded).
    pub operation_timeout: Duration,

    /// How often the background watch subscription is torn down and re-established.
    pub watch_refresh_interval: Duration,

    /// Tick of each background per-resource poller.
    pub watcher_poll_interval: Duration,

    /// Wall-clock bound for a background poller (`0s` = unbounded).
    ///
    /// When exceeded the resource is marked `failed` with a timeout error.
    pub poller_max_lifetime: Duration,

    /// Lease applied to durable lock details (`0s` = never expires).
    pub lock_ttl: Duration,

    /// Lease of the backend mutex held around the lock check-then-act.
    pub lock_acquire_ttl: Duration,

    /// Place each instance (and its bindings) in its own `sf-<id>` namespace.
    pub resource_isolation: bool,

    /// Namespace used when isolation is off.
    pub default_namespace: String,

    /// Oldest accepted protocol version (`major.minor`).
    pub min_api_version: String,

    /// Capability set selecting lock discipline and addressing.
    pub capabilities: Capabilities,

    /// Dashboard location; `None` omits `dashboard_url` from responses.
    pub dashboard: Option<DashboardConfig>,

    /// Backoff between optimistic-concurrency retries of a patch.
    pub patch_retry: BackoffPolicy,

    /// Maximum read-merge-write attempts before a `Conflict` is surfaced.
    pub patch_max_attempts: u32,

    /// Capacity of the event bus broadcast channel.
    pub bus_capacity: usize,

    /// Maximum time to wait for background pollers to stop on shutdown.
    pub grace: Duration,
}

impl BrokerConfig {
    /// Returns the synchronous wait budget as an `Option`.
    #[inline]
    pub fn operation_timeout(&self) -> Option<Duration> {
        non_zero(self.operation_timeout)
    }

    /// Returns the background poller bound as an `Option`.
    #[inline]
    pub fn poller_max_lifetime(&self) -> Option<Duration> {
        non_zero(self.poller_max_lifetime)
    }

    /// Returns the lock detail lease as an `Option`.
    #[inline]
    pub fn lock_ttl(&self) -> Option<Duration> {
        non_zero(self.lock_ttl)
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns the patch attempt budget clamped to a minimum of 1.
    #[inline]
    pub fn patch_attempts_clamped(&self) -> u32 {
        self.patch_max_attempts.max(1)
    }

    /// Returns `true` if mutating verbs take the instance lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.capabilities.locking == LockMode::Locked
    }
}

impl Default for BrokerConfig {
    /// Default configuration:
    ///
    /// - `poll_interval = 1s`, `operation_timeout = 180s`
    /// - `watch_refresh_interval = 300s`, `watcher_poll_interval = 10s`
    /// - `poller_max_lifetime = 24h`
    /// - `lock_ttl = 0s` (no expiry), `lock_acquire_ttl = 5s`
    /// - lockless OSB addressing, no isolation, `min_api_version = 2.12`
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(180),
            watch_refresh_interval: Duration::from_secs(300),
            watcher_poll_interval: Duration::from_secs(10),
            poller_max_lifetime: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::ZERO,
            lock_acquire_ttl: Duration::from_secs(5),
            resource_isolation: false,
            default_namespace: "default".to_string(),
            min_api_version: "2.12".to_string(),
            capabilities: Capabilities::default(),
            dashboard: None,
            patch_retry: BackoffPolicy {
                first: Duration::from_millis(50),
                max: Duration::from_secs(2),
                factor: 2.0,
                jitter: JitterPolicy::Equal,
            },
            patch_max_attempts: 5,
            bus_capacity: 1024,
            grace: Duration::from_secs(30),
        }
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d == Duration::ZERO { None } else { Some(d) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sentinels_become_none() {
        let cfg = BrokerConfig {
            operation_timeout: Duration::ZERO,
            poller_max_lifetime: Duration::ZERO,
            ..BrokerConfig::default()
        };
        assert!(cfg.operation_timeout().is_none());
        assert!(cfg.poller_max_lifetime().is_none());
        assert!(cfg.lock_ttl().is_none());
    }

    #[test]
    fn test_defaults_are_lockless_osb() {
        let cfg = BrokerConfig::default();
        assert!(!cfg.is_locked());
        assert_eq!(cfg.capabilities.addressing, Addressing::Osb);
        assert_eq!(cfg.operation_timeout(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_clamps() {
        let cfg = BrokerConfig {
            bus_capacity: 0,
            patch_max_attempts: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
        assert_eq!(cfg.patch_attempts_clamped(), 1);
    }
}
