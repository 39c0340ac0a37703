//! Retry policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to spread replica retries
//!
//! ## Wiring
//! ```text
//! BrokerConfig.patch_retry ──► ResourceClient::patch (Conflict → sleep → re-read → re-merge)
//! OperationWatcher          ──► watch re-subscription after a failed stream
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
