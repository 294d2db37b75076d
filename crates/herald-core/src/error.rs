//! Error types for core job types.

use thiserror::Error;

/// Errors raised by time-frame validation and constraint solving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeFrameError {
    /// The frame's axes are inconsistent (half-set pair, inverted range).
    #[error("ill-formed time frame: {0}")]
    IllFormed(String),

    /// No instant at or after the probe can ever satisfy the frame.
    #[error("time frame cannot be satisfied by any future instant")]
    Unsatisfiable,
}
