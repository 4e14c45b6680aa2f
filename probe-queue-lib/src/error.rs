//! Error handling for queueing and resilience operations.
//!
//! This module defines the error type shared by every component. Probe
//! failures, store outages, rate-limit rejections and batch timeouts each get
//! their own variant so callers can react without inspecting message text.

use crate::types::FailureKind;
use std::time::Duration;

/// Main error type for queue, cache, lock, rate-limit and batch operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// A transient probe failure that survived every retry attempt.
    #[error("Probe for '{target}' failed after {attempts} attempt(s): {kind}: {message}")]
    TransientProbe {
        target: String,
        kind: FailureKind,
        attempts: u32,
        message: String,
    },

    /// A permanent probe failure; surfaced without retrying.
    #[error("Probe for '{target}' failed permanently after {attempts} attempt(s): {kind}: {message}")]
    PermanentProbe {
        target: String,
        kind: FailureKind,
        attempts: u32,
        message: String,
    },

    /// The probe could not run on this worker. Says nothing about the target.
    #[error("Probe unavailable while checking '{target}': {message}")]
    ProbeUnavailable { target: String, message: String },

    /// The shared store could not be reached or rejected the operation.
    #[error("Shared store unavailable during {operation}: {message}")]
    StoreUnavailable { operation: String, message: String },

    /// Normal rejection: the user exceeded a limit or is banned.
    #[error("Rate limited for user {user_id} (retry after {}s)", .retry_after.as_secs().max(1))]
    RateLimited { user_id: u64, retry_after: Duration },

    /// A batch reached its deadline before every item resolved.
    #[error("Batch '{batch_id}' timed out with {unresolved} unresolved item(s)")]
    BatchTimeout { batch_id: String, unresolved: usize },

    /// Waiting on another holder's in-flight computation took too long.
    #[error("Timed out after {duration:?} waiting for result of '{fingerprint}'")]
    AwaitTimeout { fingerprint: String, duration: Duration },

    /// The lock holder vanished without publishing a result.
    #[error("In-flight lease for '{fingerprint}' expired without a result")]
    LeaseVacated { fingerprint: String },

    /// Invalid domain name in a submission.
    #[error("Invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// No job or batch exists under the given identifier.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Invalid configuration values.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// File I/O errors when reading configuration.
    #[error("File error at '{path}': {message}")]
    FileError { path: String, message: String },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Generic internal errors that don't fit other categories.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QueueError {
    /// Create a new store-unavailable error.
    pub fn store_unavailable<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid domain error.
    pub fn invalid_domain<D: Into<String>, R: Into<String>>(domain: D, reason: R) -> Self {
        Self::InvalidDomain {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error.
    pub fn config<M: Into<String>>(message: M) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new file error.
    pub fn file_error<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::FileError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error.
    pub fn not_found<I: Into<String>>(kind: &'static str, id: I) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may usefully try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientProbe { .. }
                | Self::StoreUnavailable { .. }
                | Self::RateLimited { .. }
                | Self::AwaitTimeout { .. }
                | Self::LeaseVacated { .. }
                | Self::ProbeUnavailable { .. }
        )
    }

    /// How long a rate-limited caller has to wait, if this is a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short human-readable reason shown to the requesting user.
    ///
    /// Distinguishes "unreachable", "rate limited, retry in Ns" and
    /// "temporarily degraded, try again".
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { retry_after, .. } => {
                format!("rate limited, retry in {}s", retry_after.as_secs().max(1))
            }
            Self::TransientProbe { target, .. } | Self::PermanentProbe { target, .. } => {
                format!("{} is unreachable", target)
            }
            Self::BatchTimeout { .. } | Self::AwaitTimeout { .. } => {
                "check timed out, try again".to_string()
            }
            Self::InvalidDomain { domain, .. } => format!("'{}' is not a valid domain", domain),
            Self::NotFound { kind, .. } => format!("{} not found", kind),
            _ => "temporarily degraded, try again".to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON encoding failed: {}", err),
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable {
            operation: "redis".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<crate::store::StoreError> for QueueError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::Unavailable { operation, message } => {
                Self::StoreUnavailable { operation, message }
            }
            crate::store::StoreError::Corrupt { key, message } => Self::Serialization {
                message: format!("corrupt value at '{}': {}", key, message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_has_seconds() {
        let err = QueueError::RateLimited {
            user_id: 7,
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.user_message(), "rate limited, retry in 42s");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sub_second_retry_rounds_up() {
        let err = QueueError::RateLimited {
            user_id: 7,
            retry_after: Duration::from_millis(300),
        };
        assert_eq!(err.user_message(), "rate limited, retry in 1s");
    }

    #[test]
    fn test_store_outage_reads_as_degraded() {
        let err = QueueError::store_unavailable("enqueue", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "temporarily degraded, try again");
    }

    #[test]
    fn test_probe_failures_read_as_unreachable() {
        let err = QueueError::PermanentProbe {
            target: "bad..com".to_string(),
            kind: FailureKind::MalformedInput,
            attempts: 1,
            message: "empty label".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.user_message(), "bad..com is unreachable");
    }

    #[test]
    fn test_unavailable_probe_reads_as_degraded() {
        let err = QueueError::ProbeUnavailable {
            target: "example.com:443".to_string(),
            message: "No such file or directory".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "temporarily degraded, try again");
    }
}
