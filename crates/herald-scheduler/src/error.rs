//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An instance with the same id is already scheduled or running.
    #[error("instance already scheduled: {0}")]
    InstanceExists(String),

    /// The instance belongs to a different partition.
    #[error("instance {id} belongs to partition {actual}, scheduler owns {expected}")]
    WrongPartition {
        /// Instance id.
        id: String,
        /// Partition the scheduler owns.
        expected: String,
        /// Partition the instance carries.
        actual: String,
    },

    /// The instance is already in a terminal state.
    #[error("instance {0} is terminal and cannot be scheduled")]
    Terminal(String),
}
