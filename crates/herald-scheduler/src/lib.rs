//! Partitioned job scheduler for Herald.
//!
//! This crate provides the per-partition scheduling loop that:
//! - Polls the partition's working set for due instances
//! - Dispatches each execution onto its own task
//! - Honors deadlines, time-frame gating, and overlap suppression
//! - Translates temporary/rate-limit/permanent failures into deferral,
//!   drop, or terminal state

mod error;
mod listener;
mod processor;
mod scheduler;

pub use error::SchedulerError;
pub use listener::JobListener;
pub use processor::{ExecutionError, Processor};
pub use scheduler::{JobScheduler, SchedulerOptions};
