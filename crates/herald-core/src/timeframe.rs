//! Recurring calendar-window constraints.
//!
//! A [`TimeFrame`] describes a recurring window (year range, month range,
//! weekday, time-of-day range) during which execution is permitted. A
//! [`TimeFrameSet`] combines frames: an instant satisfies the set iff every
//! frame contains it, and the set can compute the earliest instant at or
//! after a probe that is worth waking up for.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimeFrameError;

/// A recurring calendar/time-of-day window.
///
/// Every axis is optional; an absent axis is unconstrained. When one end of
/// a (start, end) pair is set the other must be set too, which
/// [`TimeFrame::validate`] enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    /// First year the frame is open (inclusive).
    pub start_year: Option<i32>,
    /// Last year the frame is open (inclusive).
    pub end_year: Option<i32>,
    /// First month the frame is open (1-12, inclusive).
    pub start_month: Option<u32>,
    /// Last month the frame is open (1-12, inclusive).
    pub end_month: Option<u32>,
    /// Weekday the frame is restricted to.
    pub weekday: Option<Weekday>,
    /// Start of the daily window.
    pub start_time: Option<NaiveTime>,
    /// End of the daily window (inclusive).
    pub end_time: Option<NaiveTime>,
}

impl TimeFrame {
    /// Create an unconstrained frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the frame to a year range (inclusive on both ends).
    pub fn with_years(mut self, start: i32, end: i32) -> Self {
        self.start_year = Some(start);
        self.end_year = Some(end);
        self
    }

    /// Restrict the frame to a month range (1-12, inclusive on both ends).
    pub fn with_months(mut self, start: u32, end: u32) -> Self {
        self.start_month = Some(start);
        self.end_month = Some(end);
        self
    }

    /// Restrict the frame to a single weekday.
    pub fn with_weekday(mut self, weekday: Weekday) -> Self {
        self.weekday = Some(weekday);
        self
    }

    /// Restrict the frame to a daily time window (inclusive on both ends).
    pub fn with_times(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Check the frame for ill-formed axis pairs.
    pub fn validate(&self) -> Result<(), TimeFrameError> {
        fn paired<T>(start: Option<&T>, end: Option<&T>, axis: &str) -> Result<(), TimeFrameError> {
            match (start, end) {
                (Some(_), None) | (None, Some(_)) => Err(TimeFrameError::IllFormed(format!(
                    "{axis} range must set both ends"
                ))),
                _ => Ok(()),
            }
        }

        paired(self.start_year.as_ref(), self.end_year.as_ref(), "year")?;
        paired(self.start_month.as_ref(), self.end_month.as_ref(), "month")?;
        paired(self.start_time.as_ref(), self.end_time.as_ref(), "time")?;

        if let (Some(start), Some(end)) = (self.start_year, self.end_year)
            && start > end
        {
            return Err(TimeFrameError::IllFormed(format!(
                "year range {start}..{end} is inverted"
            )));
        }
        if let (Some(start), Some(end)) = (self.start_month, self.end_month) {
            if !(1..=12).contains(&start) || !(1..=12).contains(&end) {
                return Err(TimeFrameError::IllFormed(format!(
                    "months must be within 1-12, got {start}..{end}"
                )));
            }
            if start > end {
                return Err(TimeFrameError::IllFormed(format!(
                    "month range {start}..{end} is inverted"
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time)
            && start > end
        {
            return Err(TimeFrameError::IllFormed(format!(
                "time window {start}..{end} is inverted"
            )));
        }

        Ok(())
    }

    /// Whether the frame contains `instant`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let date = instant.date_naive();

        if let Some(start) = self.start_year
            && date.year() < start
        {
            return false;
        }
        if let Some(end) = self.end_year
            && date.year() > end
        {
            return false;
        }
        if let Some(start) = self.start_month
            && date.month() < start
        {
            return false;
        }
        if let Some(end) = self.end_month
            && date.month() > end
        {
            return false;
        }
        if let Some(weekday) = self.weekday
            && date.weekday() != weekday
        {
            return false;
        }

        let time = instant.time();
        if let Some(start) = self.start_time
            && time < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && time > end
        {
            return false;
        }

        true
    }

    /// Earliest instant at or after `from` contained in this frame.
    ///
    /// Returns [`TimeFrameError::Unsatisfiable`] when the frame's year range
    /// lies entirely in the past relative to `from`. If `from` is already
    /// contained, it is returned unchanged.
    pub fn earliest_instant_at_or_after(
        &self,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TimeFrameError> {
        let mut candidate = from;

        // Time-of-day first: snap forward to today's window start, keep an
        // instant already inside the window, or roll to tomorrow's start
        // once the window has closed.
        if let Some(start) = self.start_time {
            let time = candidate.time();
            if time < start {
                candidate = at_time(candidate.date_naive(), start);
            } else if self.end_time.is_some_and(|end| time > end) {
                let tomorrow = add_days(candidate.date_naive(), 1)?;
                candidate = at_time(tomorrow, start);
            }
        }

        // A start year still in the future overrides the candidate date
        // wholesale; weekday/month alignment then runs from January 1st.
        if let Some(start) = self.start_year
            && candidate.year() < start
        {
            candidate = at_time(first_of_month(start, 1)?, self.day_start());
        }

        candidate = self.align_date(candidate)?;

        if let Some(end) = self.end_year
            && candidate.year() > end
        {
            return Err(TimeFrameError::Unsatisfiable);
        }

        Ok(candidate)
    }

    /// Advance `candidate` until both the weekday and the month window are
    /// satisfied.
    ///
    /// Each adjustment can re-violate the other axis (a month jump lands on
    /// a different weekday, a weekday jump can leave the month window), so
    /// this loops until a full pass changes nothing. Every day-granularity
    /// jump resets the time-of-day to the window start.
    fn align_date(&self, mut candidate: DateTime<Utc>) -> Result<DateTime<Utc>, TimeFrameError> {
        loop {
            let before = candidate;

            if let Some(weekday) = self.weekday {
                let ahead = days_until_weekday(candidate.date_naive(), weekday);
                if ahead > 0 {
                    let date = add_days(candidate.date_naive(), ahead)?;
                    candidate = at_time(date, self.day_start());
                }
            }

            if let Some((start, end)) = self.month_window() {
                let month = candidate.month();
                if month < start {
                    candidate = at_time(first_of_month(candidate.year(), start)?, self.day_start());
                } else if month > end {
                    candidate =
                        at_time(first_of_month(candidate.year() + 1, start)?, self.day_start());
                }
            }

            if let Some(end) = self.end_year
                && candidate.year() > end
            {
                return Err(TimeFrameError::Unsatisfiable);
            }

            if candidate == before {
                return Ok(candidate);
            }
        }
    }

    /// Earliest time-of-day on a freshly reached day.
    fn day_start(&self) -> NaiveTime {
        self.start_time.unwrap_or(NaiveTime::MIN)
    }

    /// The month window, tolerating a half-set pair.
    fn month_window(&self) -> Option<(u32, u32)> {
        match (self.start_month, self.end_month) {
            (None, None) => None,
            (start, end) => Some((start.unwrap_or(1), end.unwrap_or(12))),
        }
    }
}

/// A conjunction of time frames.
///
/// An instant satisfies the set iff **all** frames contain it. The empty
/// set is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeFrameSet {
    frames: Vec<TimeFrame>,
}

impl TimeFrameSet {
    /// Build a set from frames.
    pub fn new(frames: Vec<TimeFrame>) -> Self {
        Self { frames }
    }

    /// The unconstrained (empty) set.
    pub fn unconstrained() -> Self {
        Self::default()
    }

    /// Whether the set has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate the frames.
    pub fn iter(&self) -> impl Iterator<Item = &TimeFrame> {
        self.frames.iter()
    }

    /// Validate every frame in the set.
    pub fn validate(&self) -> Result<(), TimeFrameError> {
        for frame in &self.frames {
            frame.validate()?;
        }
        Ok(())
    }

    /// Whether every frame contains `instant`. Empty set contains all.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.frames.iter().all(|frame| frame.contains(instant))
    }

    /// Earliest instant at or after `from` worth waking up for.
    ///
    /// Returns `from` unchanged when the set is empty or any frame already
    /// contains it; otherwise the minimum of the per-frame earliest
    /// instants (each of which is strictly after `from`).
    pub fn earliest_instant(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, TimeFrameError> {
        if self.frames.is_empty() || self.frames.iter().any(|frame| frame.contains(from)) {
            return Ok(from);
        }

        let mut earliest: Option<DateTime<Utc>> = None;
        for frame in &self.frames {
            let instant = frame.earliest_instant_at_or_after(from)?;
            earliest = Some(match earliest {
                Some(current) => current.min(instant),
                None => instant,
            });
        }

        // Non-empty by the branch above.
        earliest.ok_or(TimeFrameError::Unsatisfiable)
    }
}

impl From<Vec<TimeFrame>> for TimeFrameSet {
    fn from(frames: Vec<TimeFrame>) -> Self {
        Self::new(frames)
    }
}

fn at_time(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    NaiveDateTime::new(date, time).and_utc()
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, TimeFrameError> {
    date.checked_add_days(Days::new(days))
        .ok_or(TimeFrameError::Unsatisfiable)
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate, TimeFrameError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| TimeFrameError::IllFormed(format!("invalid calendar date {year}-{month:02}-01")))
}

/// Days to advance (0-6) until `date` falls on `target`.
fn days_until_weekday(date: NaiveDate, target: Weekday) -> u64 {
    let current = date.weekday().num_days_from_monday();
    let wanted = target.num_days_from_monday();
    u64::from((wanted + 7 - current) % 7)
}
