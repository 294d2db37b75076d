//! Error types for channels and resolvers.

use std::time::Duration;

use thiserror::Error;

/// How a channel send failed.
///
/// Mirrors the scheduler's failure taxonomy at the channel boundary: the
/// dispatch layer maps these 1:1 into execution outcomes. Anything a
/// channel throws that is not temporary or rate-limited is permanent.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The message can never be delivered (bad address, rejected payload).
    #[error("permanent channel failure: {reason}")]
    Permanent {
        /// Operator-visible description.
        reason: String,
    },

    /// The remote end is momentarily unavailable.
    #[error("temporary channel failure: {reason}")]
    Temporary {
        /// Operator-visible description.
        reason: String,
        /// Explicit retry delay, when the remote end supplied one.
        retry_after: Option<Duration>,
    },

    /// The remote end is throttling us.
    #[error("channel rate limited: {reason}")]
    RateLimited {
        /// Operator-visible description.
        reason: String,
        /// Explicit retry delay, when the remote end supplied one.
        retry_after: Option<Duration>,
    },
}

impl ChannelError {
    /// A failure that must not be retried.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// A recoverable failure without an explicit retry delay.
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// A recoverable failure carrying the remote end's retry delay.
    pub fn temporary_after(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Temporary {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    /// A throttling response without an explicit retry delay.
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
}

/// Recipient or message resolution failed.
///
/// Resolution failures are not retried by the dispatch layer; a resolver
/// that can recover should do so internally.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The resume cursor does not belong to this resolver.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// The job's parameters are missing something the resolver needs.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// Anything else.
    #[error("resolution failed: {0}")]
    Failed(String),
}
