//! Per-instance job policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TimeFrameError;
use crate::timeframe::TimeFrameSet;

/// Defer count meaning "unlimited deferral tolerance".
pub const UNLIMITED_DEFERS: i32 = -1;

/// Immutable per-instance execution policy.
///
/// Owned by exactly one [`JobInstance`](crate::JobInstance); value
/// semantics, never shared mutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Whether exceeding the defer budget drops the instance.
    pub droppable: bool,
    /// Maximum tolerated deferrals; [`UNLIMITED_DEFERS`] disables the
    /// budget, `0` tolerates deferral only to wait for a time-frame window.
    pub max_defer_count: i32,
    /// Hard cutoff after which the instance is abandoned without running.
    pub deadline: Option<DateTime<Utc>>,
    /// Calendar windows gating when execution is permitted.
    pub time_frames: TimeFrameSet,
    /// Arbitrary parameters handed through to the processor.
    pub parameters: Map<String, Value>,
}

impl Default for JobConfiguration {
    fn default() -> Self {
        Self {
            droppable: false,
            max_defer_count: UNLIMITED_DEFERS,
            deadline: None,
            time_frames: TimeFrameSet::unconstrained(),
            parameters: Map::new(),
        }
    }
}

impl JobConfiguration {
    /// Default policy: not droppable, unlimited defers, unconstrained.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow the scheduler to drop the instance once the defer budget is
    /// exceeded.
    pub fn droppable(mut self) -> Self {
        self.droppable = true;
        self
    }

    /// Cap the number of tolerated deferrals.
    pub fn with_max_defer_count(mut self, max: i32) -> Self {
        self.max_defer_count = max;
        self
    }

    /// Abandon the instance once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Gate execution behind calendar windows.
    pub fn with_time_frames(mut self, time_frames: impl Into<TimeFrameSet>) -> Self {
        self.time_frames = time_frames.into();
        self
    }

    /// Attach a processor-visible parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Whether `defer_count` deferrals have exceeded the budget.
    pub fn defer_budget_exhausted(&self, defer_count: u32) -> bool {
        self.max_defer_count >= 0 && defer_count > self.max_defer_count as u32
    }

    /// Validate the policy's time frames.
    pub fn validate(&self) -> Result<(), TimeFrameError> {
        self.time_frames.validate()
    }
}
