//! Error types for context construction and submission.

use thiserror::Error;

use herald_core::TimeFrameError;
use herald_scheduler::SchedulerError;

use crate::config::ConfigIssue;

/// Errors raised by context construction and instance submission.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The configuration is incomplete or inconsistent; carries the full
    /// list of problems, not just the first.
    #[error("invalid configuration ({} issue(s))", .0.len())]
    Invalid(Vec<ConfigIssue>),

    /// An instance carries ill-formed or unsatisfiable time frames.
    #[error(transparent)]
    TimeFrame(#[from] TimeFrameError),

    /// The owning scheduler rejected the instance.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// No processor is registered for the instance's job type.
    #[error("no processor registered for job type {0}")]
    UnknownJobType(String),

    /// No channel is registered for the requested channel type.
    #[error("no channel registered for channel type {0}")]
    UnknownChannel(String),
}

impl ContextError {
    /// The configuration issues, when this is a validation failure.
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            Self::Invalid(issues) => issues,
            _ => &[],
        }
    }
}
