//! Core types for the Herald scheduling engine.
//!
//! This crate holds the leaf value types and pure algorithms:
//! - Job instances, triggers, notifications, and their lifecycle state
//! - Per-instance execution policy ([`JobConfiguration`])
//! - Recurring schedules behind the [`Schedule`] contract
//! - Calendar-window constraints and the earliest-instant algorithm

mod config;
mod error;
mod instance;
mod schedule;
mod timeframe;

pub use config::{JobConfiguration, UNLIMITED_DEFERS};
pub use error::TimeFrameError;
pub use instance::{JobInstance, JobKind, JobState, PartitionKey, Recipient, RecipientCursor};
pub use schedule::{IntervalSchedule, OnceSchedule, Schedule, ScheduleContext};
pub use timeframe::{TimeFrame, TimeFrameSet};
