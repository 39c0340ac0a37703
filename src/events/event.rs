//! # Runtime events emitted by the controller, lock manager and pollers.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Operation events**: lifecycle verbs accepted, completed, failed
//! - **Lock events**: acquisition, rejection, release
//! - **Reconciliation events**: synchronous waits and background pollers
//! - **Subscriber events**: overflow and panic isolation in the fan-out
//!
//! The [`Event`] struct carries metadata such as timestamps, resource name,
//! operation, observed state, reasons and elapsed time.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use brokervisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::LockRejected)
//!     .with_resource("i1")
//!     .with_operation("update")
//!     .with_reason("Could not acquire lock");
//!
//! assert_eq!(ev.kind, EventKind::LockRejected);
//! assert_eq!(ev.resource.as_deref(), Some("i1"));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `resource`: subscriber name
    /// - `reason`: panic info
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `resource`: subscriber name
    /// - `reason`: overflow detail
    SubscriberOverflow,

    // === Operation events ===
    /// A lifecycle verb wrote its resource and was accepted.
    ///
    /// Sets:
    /// - `resource`: instance or binding id
    /// - `operation`: verb (`create`, `update`, `delete`, `bind`, `unbind`)
    OperationAccepted,

    /// A lifecycle verb observed a non-failure terminal state.
    ///
    /// Sets:
    /// - `resource`, `operation`, `state`
    OperationCompleted,

    /// A lifecycle verb failed (store error, failed state, timeout).
    ///
    /// Sets:
    /// - `resource`, `operation`
    /// - `reason`: error label and message
    OperationFailed,

    // === Lock events ===
    /// A WRITE lock was recorded for a resource.
    ///
    /// Sets:
    /// - `resource`: lock name
    /// - `operation`: holder operation
    LockAcquired,

    /// A lock request was rejected because another operation holds the lock.
    ///
    /// Sets:
    /// - `resource`, `operation`, `reason`
    LockRejected,

    /// Lock details were cleared.
    ///
    /// Sets:
    /// - `resource`: lock name
    LockReleased,

    // === Reconciliation events ===
    /// A synchronous wait exceeded its budget.
    ///
    /// Sets:
    /// - `resource`, `state` (start state), `timeout_ms`, `elapsed_ms`
    TimeoutHit,

    /// Watch subscription (re-)established.
    ///
    /// Sets:
    /// - `resource`: `<group>/<type>` being watched
    WatchEstablished,

    /// Watch subscription torn down after its refresh interval.
    ///
    /// Sets:
    /// - `resource`: `<group>/<type>`
    WatchRefreshed,

    /// Watch subscription failed and will be retried.
    ///
    /// Sets:
    /// - `resource`: `<group>/<type>`, `reason`, `delay_ms`
    WatchFailed,

    /// A background poller started for a resource.
    ///
    /// Sets:
    /// - `resource`: resource name
    PollerStarted,

    /// A background poller observed an intermediate status.
    ///
    /// Sets:
    /// - `resource`, `state`, `reason` (on source errors)
    PollerTick,

    /// A background poller stopped (terminal state, lifetime bound, or cancellation).
    ///
    /// Sets:
    /// - `resource`, `state` (when terminal), `elapsed_ms`
    PollerStopped,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or explicit call).
    ShutdownRequested,

    /// All pollers stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some pollers did not stop in time.
    GraceExceeded,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Resource (or lock / subscriber) name, if applicable.
    pub resource: Option<Arc<str>>,
    /// Protocol operation (`create`, `update`, ...), if applicable.
    pub operation: Option<Arc<str>>,
    /// Observed resource state, if applicable.
    pub state: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Elapsed time in milliseconds (compact).
    pub elapsed_ms: Option<u32>,
    /// Timeout budget in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Retry delay in milliseconds (compact).
    pub delay_ms: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            resource: None,
            operation: None,
            state: None,
            reason: None,
            elapsed_ms: None,
            timeout_ms: None,
            delay_ms: None,
        }
    }

    /// Attaches a resource name.
    #[inline]
    pub fn with_resource(mut self, resource: impl Into<Arc<str>>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Attaches an operation name.
    #[inline]
    pub fn with_operation(mut self, operation: impl Into<Arc<str>>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attaches an observed state.
    #[inline]
    pub fn with_state(mut self, state: impl Into<Arc<str>>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an elapsed duration (stored as milliseconds).
    #[inline]
    pub fn with_elapsed(mut self, d: Duration) -> Self {
        self.elapsed_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a timeout budget (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a retry delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(compact_ms(d));
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_resource(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_resource(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

fn compact_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Event::new(EventKind::LockAcquired);
        let b = Event::new(EventKind::LockReleased);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_durations_saturate() {
        let ev = Event::new(EventKind::TimeoutHit)
            .with_timeout(Duration::from_secs(u64::MAX))
            .with_elapsed(Duration::from_millis(250));
        assert_eq!(ev.timeout_ms, Some(u32::MAX));
        assert_eq!(ev.elapsed_ms, Some(250));
    }
}
