//! Processor contract and execution outcomes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_core::{JobInstance, RecipientCursor};

/// How an execution attempt failed.
///
/// The scheduler is the only component that interprets these into state
/// transitions. Temporary and rate-limit failures defer the instance;
/// everything else is permanent.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Not retried; the instance transitions to `Failed`.
    #[error("permanent failure: {reason}")]
    Permanent {
        /// Operator-visible description.
        reason: String,
    },

    /// Recoverable; the instance is deferred and retried.
    #[error("temporary failure: {reason}")]
    Temporary {
        /// Operator-visible description.
        reason: String,
        /// Explicit retry delay; the scheduler's default backoff applies
        /// when absent.
        defer: Option<Duration>,
    },

    /// The remote end is throttling us. Same deferral mechanics as a
    /// temporary failure, classified separately for observability.
    #[error("rate limited: {reason}")]
    RateLimited {
        /// Operator-visible description.
        reason: String,
        /// Explicit retry delay; the scheduler's default backoff applies
        /// when absent.
        retry_after: Option<Duration>,
    },
}

impl ExecutionError {
    /// A failure that must not be retried.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// A recoverable failure retried after the default backoff.
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary {
            reason: reason.into(),
            defer: None,
        }
    }

    /// A recoverable failure retried after an explicit delay.
    pub fn temporary_after(reason: impl Into<String>, defer: Duration) -> Self {
        Self::Temporary {
            reason: reason.into(),
            defer: Some(defer),
        }
    }

    /// A throttling response retried after the default backoff.
    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// A throttling response carrying the remote end's retry delay.
    pub fn rate_limited_after(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    /// The explicit retry delay, when one was signalled.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Permanent { .. } => None,
            Self::Temporary { defer, .. } => *defer,
            Self::RateLimited { retry_after, .. } => *retry_after,
        }
    }

    /// Whether the failure defers rather than terminates the instance.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Executes one due instance per scheduler tick.
///
/// A fan-out processor returns `Ok(Some(cursor))` to request re-invocation
/// with the advanced cursor, and `Ok(None)` once the recipient set is
/// exhausted. Processors for every other kind must return `Ok(None)` on
/// success. Implementations must be safe to retry when they signal a
/// temporary or rate-limit failure.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run one execution attempt for `instance`.
    async fn process(
        &self,
        instance: &mut JobInstance,
    ) -> Result<Option<RecipientCursor>, ExecutionError>;
}
