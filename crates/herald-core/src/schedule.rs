//! Recurring schedule contract and built-in implementations.

use chrono::{DateTime, Duration, Utc};

/// Execution history a schedule may consult when computing the next run.
///
/// All fields are optional; a fresh instance has no history and schedules
/// from "now".
#[derive(Debug, Clone, Default)]
pub struct ScheduleContext {
    /// When the last execution was scheduled to start.
    pub last_scheduled_execution: Option<DateTime<Utc>>,
    /// When the last execution actually started.
    pub last_actual_execution: Option<DateTime<Utc>>,
    /// When the last execution reached a terminal or deferred state.
    pub last_completion: Option<DateTime<Utc>>,
}

/// Pure function from execution history to the next execution instant.
///
/// Implementations must be side-effect free; cron-like schedules plug in
/// behind this single method.
pub trait Schedule: Send + Sync {
    /// Next execution instant given the history in `ctx`.
    fn next_schedule(&self, ctx: &ScheduleContext) -> DateTime<Utc>;

    /// Next execution instant for an instance with no history.
    fn next_schedule_now(&self) -> DateTime<Utc> {
        self.next_schedule(&ScheduleContext::default())
    }
}

/// Fires once at a fixed instant.
#[derive(Debug, Clone)]
pub struct OnceSchedule {
    at: DateTime<Utc>,
}

impl OnceSchedule {
    /// Schedule a single execution at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Schedule for OnceSchedule {
    fn next_schedule(&self, _ctx: &ScheduleContext) -> DateTime<Utc> {
        self.at
    }
}

/// Fires every fixed interval from the last scheduled execution.
///
/// The first computation (no history) is due immediately.
#[derive(Debug, Clone)]
pub struct IntervalSchedule {
    every: Duration,
}

impl IntervalSchedule {
    /// Schedule executions `every` apart.
    pub fn new(every: Duration) -> Self {
        Self { every }
    }

    /// Convenience constructor from whole seconds.
    pub fn seconds(seconds: i64) -> Self {
        Self::new(Duration::seconds(seconds))
    }
}

impl Schedule for IntervalSchedule {
    fn next_schedule(&self, ctx: &ScheduleContext) -> DateTime<Utc> {
        match ctx.last_scheduled_execution {
            Some(last) => last + self.every,
            None => Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_schedule_always_returns_its_instant() {
        let at = Utc::now() + Duration::hours(2);
        let schedule = OnceSchedule::new(at);

        assert_eq!(schedule.next_schedule_now(), at);

        let ctx = ScheduleContext {
            last_scheduled_execution: Some(Utc::now()),
            last_actual_execution: Some(Utc::now()),
            last_completion: Some(Utc::now()),
        };
        assert_eq!(schedule.next_schedule(&ctx), at);
    }

    #[test]
    fn interval_schedule_without_history_is_due_now() {
        let schedule = IntervalSchedule::seconds(3600);
        let before = Utc::now();
        let next = schedule.next_schedule_now();
        assert!(next >= before);
        assert!(next <= Utc::now());
    }

    #[test]
    fn interval_schedule_advances_from_last_scheduled_execution() {
        let schedule = IntervalSchedule::seconds(60);
        let last = Utc::now() - Duration::hours(2);
        let ctx = ScheduleContext {
            last_scheduled_execution: Some(last),
            ..Default::default()
        };
        assert_eq!(schedule.next_schedule(&ctx), last + Duration::seconds(60));
    }
}
