//! Error types used by the broker runtime, the store client and the protocol controller.
//!
//! This module defines two main error enums:
//!
//! - [`BrokerError`]: the broker-wide taxonomy every layer speaks.
//! - [`RuntimeError`]: errors raised by the background runtime itself.
//!
//! Backend failures are reclassified into [`BrokerError`] at the client boundary
//! through [`BrokerError::from_status`], a pure status-code table, so upper layers
//! never inspect backend-specific codes.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by the broker runtime.
///
/// These represent failures in the background machinery (watchers, pollers),
/// such as a shutdown sequence exceeding its grace period.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some pollers remained active.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Resource names whose pollers did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use brokervisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck pollers={stuck:?}")
            }
        }
    }
}

/// # Broker-wide error taxonomy.
///
/// Every store, lock and protocol failure is expressed as one of these kinds.
/// Verb handlers match on the specific kinds they can turn into a protocol
/// response (`Conflict` → 409, `NotFound` → 410, ...) and propagate the rest.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed or disallowed input (e.g. an illegal plan transition).
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of what was rejected.
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Backend message.
        message: String,
    },

    /// Duplicate create or a stale `resourceVersion` on write.
    #[error("conflict: {message}")]
    Conflict {
        /// Backend message.
        message: String,
    },

    /// The backend refused the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Backend message.
        message: String,
    },

    /// The resource existed but has been removed.
    #[error("gone: {message}")]
    Gone {
        /// Backend message.
        message: String,
    },

    /// The operation did not leave its initial state within budget.
    #[error("timed out after {timeout:?}: {message}")]
    Timeout {
        /// The budget that was exceeded.
        timeout: Duration,
        /// What was being waited on.
        message: String,
    },

    /// The resource is write-locked by another operation.
    #[error("lock conflict on '{name}': {message}")]
    LockConflict {
        /// Lock name (instance id).
        name: String,
        /// Human-readable reason, including the holder's operation when known.
        message: String,
    },

    /// The caller speaks a protocol version that is too old.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the unmet precondition.
        message: String,
    },

    /// The opaque operation token could not be decoded.
    #[error("invalid operation token: {message}")]
    InvalidToken {
        /// Decoder message.
        message: String,
    },

    /// Unclassified backend failure.
    #[error("internal error: {message}")]
    Internal {
        /// Backend message.
        message: String,
    },
}

impl BrokerError {
    /// Maps a backend status code to an error kind.
    ///
    /// Unknown codes collapse into [`BrokerError::Internal`]. A `504` carries
    /// no budget, so the resulting [`BrokerError::Timeout`] has a zero `timeout`.
    ///
    /// # Example
    /// ```
    /// use brokervisor::BrokerError;
    ///
    /// let err = BrokerError::from_status(409, "already exists");
    /// assert_eq!(err.as_label(), "conflict");
    /// assert_eq!(BrokerError::from_status(503, "down").as_label(), "internal");
    /// ```
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => BrokerError::BadRequest { message },
            403 => BrokerError::Forbidden { message },
            404 => BrokerError::NotFound { message },
            409 => BrokerError::Conflict { message },
            410 => BrokerError::Gone { message },
            412 => BrokerError::PreconditionFailed { message },
            504 => BrokerError::Timeout {
                timeout: Duration::ZERO,
                message,
            },
            _ => BrokerError::Internal { message },
        }
    }

    /// Returns the HTTP-shaped status code used when this error reaches the protocol surface.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::BadRequest { .. } => 400,
            BrokerError::Forbidden { .. } => 403,
            BrokerError::NotFound { .. } => 404,
            BrokerError::Conflict { .. } => 409,
            BrokerError::Gone { .. } => 410,
            BrokerError::PreconditionFailed { .. } => 412,
            BrokerError::LockConflict { .. } => 422,
            BrokerError::InvalidToken { .. } => 400,
            BrokerError::Timeout { .. } => 504,
            BrokerError::Internal { .. } => 500,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::BadRequest { .. } => "bad_request",
            BrokerError::NotFound { .. } => "not_found",
            BrokerError::Conflict { .. } => "conflict",
            BrokerError::Forbidden { .. } => "forbidden",
            BrokerError::Gone { .. } => "gone",
            BrokerError::Timeout { .. } => "timeout",
            BrokerError::LockConflict { .. } => "lock_conflict",
            BrokerError::PreconditionFailed { .. } => "precondition_failed",
            BrokerError::InvalidToken { .. } => "invalid_token",
            BrokerError::Internal { .. } => "internal",
        }
    }

    /// Returns the bare message without the kind prefix.
    ///
    /// Used when the message is interpolated into a user-facing description.
    pub fn as_message(&self) -> String {
        match self {
            BrokerError::BadRequest { message }
            | BrokerError::NotFound { message }
            | BrokerError::Conflict { message }
            | BrokerError::Forbidden { message }
            | BrokerError::Gone { message }
            | BrokerError::PreconditionFailed { message }
            | BrokerError::InvalidToken { message }
            | BrokerError::Internal { message } => message.clone(),
            BrokerError::Timeout { message, .. } => message.clone(),
            BrokerError::LockConflict { message, .. } => message.clone(),
        }
    }

    /// Shorthand constructor for [`BrokerError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        BrokerError::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BrokerError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        BrokerError::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BrokerError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        BrokerError::Conflict {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BrokerError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        BrokerError::Internal {
            message: message.into(),
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound { .. })
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, BrokerError::Conflict { .. })
    }

    #[inline]
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, BrokerError::LockConflict { .. })
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Internal {
            message: format!("json: {err}"),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type BrokerResult<T> = Result<T, BrokerError>;
