//! Typed errors for the store and execution layers.
//!
//! Store-layer errors (`Validation`, `NotFound`, `Schema`) are returned
//! synchronously to the caller that requested the mutation. Handler errors
//! are recorded on the execution record and surfaced to metrics; they never
//! take down the dispatcher or coordinator.

use std::time::Duration;

use crate::retry::RetryReason;

/// Errors from the Action Store and schema validation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed action definition rejected at write time.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown action id.
    #[error("action not found: {0}")]
    NotFound(String),

    /// Kind-specific parameter schema check failed at write time.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reported by a sub-action handler at run time.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the executor retries with bounded backoff.
    #[error("{message}")]
    Recoverable {
        message: String,
        reason: RetryReason,
        /// Server-suggested delay (e.g. from a Retry-After header).
        retry_after: Option<Duration>,
    },

    /// Non-recoverable failure; the run stops at this step.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    /// A generic transient failure with no server-suggested delay.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            reason: RetryReason::Transient,
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_constructor_defaults() {
        let err = HandlerError::recoverable("socket closed");
        match err {
            HandlerError::Recoverable {
                reason,
                retry_after,
                ..
            } => {
                assert_eq!(reason, RetryReason::Transient);
                assert!(retry_after.is_none());
            }
            HandlerError::Fatal(_) => panic!("expected recoverable"),
        }
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound("abc".into());
        assert_eq!(err.to_string(), "action not found: abc");
    }
}
