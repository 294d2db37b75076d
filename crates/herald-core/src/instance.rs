//! Job instances and their lifecycle state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobConfiguration;
use crate::schedule::Schedule;

/// Lifecycle state of a job instance or notification.
///
/// `New` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to run (or re-run after deferral).
    #[default]
    New,
    /// Completed successfully.
    Done,
    /// Failed permanently.
    Failed,
    /// Dropped after exceeding the defer budget.
    Dropped,
    /// Abandoned because the configured deadline passed.
    DeadlineReached,
}

impl JobState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::New)
    }
}

/// Grouping value deciding which scheduler loop owns an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Build a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A notification target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable identifier within the host application.
    pub id: String,
    /// Channel-specific address (email address, device token, ...).
    pub address: String,
    /// Human-readable name, if known.
    pub display_name: Option<String>,
    /// BCP 47 locale tag used for message resolution.
    pub locale: Option<String>,
}

impl Recipient {
    /// Build a recipient from its id and address.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            display_name: None,
            locale: None,
        }
    }

    /// Attach a display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Attach a locale tag.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Opaque resume token for incremental recipient fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientCursor(String);

impl RecipientCursor {
    /// Wrap a resolver-produced token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of work an instance represents.
#[derive(Clone)]
pub enum JobKind {
    /// Plain one-shot unit of work.
    Task,
    /// Recurring trigger; its identity is its partition key.
    Trigger {
        /// Computes the next fire instant at each pickup.
        schedule: Arc<dyn Schedule>,
        /// Whether a new execution may start while a prior one is in flight.
        allow_overlap: bool,
    },
    /// Notification job fanning out to many recipients incrementally.
    Fanout {
        /// Channel the produced notifications are dispatched through.
        channel_type: String,
        /// Resume token; the only state needed to continue after a crash.
        cursor: Option<RecipientCursor>,
    },
    /// One per (job, recipient) pair, produced during fan-out.
    Notification {
        /// The resolved target.
        recipient: Recipient,
        /// Channel this notification is dispatched through.
        channel_type: String,
    },
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Task => f.write_str("Task"),
            JobKind::Trigger { allow_overlap, .. } => f
                .debug_struct("Trigger")
                .field("allow_overlap", allow_overlap)
                .finish_non_exhaustive(),
            JobKind::Fanout {
                channel_type,
                cursor,
            } => f
                .debug_struct("Fanout")
                .field("channel_type", channel_type)
                .field("cursor", cursor)
                .finish(),
            JobKind::Notification {
                recipient,
                channel_type,
            } => f
                .debug_struct("Notification")
                .field("recipient", &recipient.id)
                .field("channel_type", channel_type)
                .finish(),
        }
    }
}

/// A schedulable unit of work.
///
/// Mutated only by the scheduler loop that owns its partition; destroyed
/// (removed from the working set) on reaching a terminal state.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Unique identity.
    pub id: String,
    /// Routing key mapping the instance to processors and partitions.
    pub job_type: String,
    /// Which scheduler loop owns this instance.
    pub partition_key: PartitionKey,
    /// Lifecycle state.
    pub state: JobState,
    /// Number of deferrals so far; monotonically increasing.
    pub defer_count: u32,
    /// When the instance should next be offered to the processor.
    pub schedule_time: DateTime<Utc>,
    /// When the instance was created.
    pub creation_time: DateTime<Utc>,
    /// When the instance last started executing.
    pub last_execution_time: Option<DateTime<Utc>>,
    /// When the instance last reached a terminal or deferred outcome.
    pub last_completion_time: Option<DateTime<Utc>>,
    /// Execution policy.
    pub config: JobConfiguration,
    /// Work discriminant.
    pub kind: JobKind,
}

impl JobInstance {
    /// Create a one-shot task due immediately.
    pub fn new(
        job_type: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        config: JobConfiguration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            partition_key: partition_key.into(),
            state: JobState::New,
            defer_count: 0,
            schedule_time: now,
            creation_time: now,
            last_execution_time: None,
            last_completion_time: None,
            config,
            kind: JobKind::Task,
        }
    }

    /// Create a recurring trigger.
    ///
    /// The trigger's identity is its partition key, and its initial
    /// schedule time is the schedule's own next instant.
    pub fn trigger(
        job_type: impl Into<String>,
        config: JobConfiguration,
        schedule: Arc<dyn Schedule>,
        allow_overlap: bool,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        Self {
            partition_key: PartitionKey::new(&id),
            id,
            job_type: job_type.into(),
            state: JobState::New,
            defer_count: 0,
            schedule_time: schedule.next_schedule_now(),
            creation_time: now,
            last_execution_time: None,
            last_completion_time: None,
            config,
            kind: JobKind::Trigger {
                schedule,
                allow_overlap,
            },
        }
    }

    /// Create a notification job that fans out through `channel_type`.
    pub fn fanout(
        job_type: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        channel_type: impl Into<String>,
        config: JobConfiguration,
    ) -> Self {
        let mut instance = Self::new(job_type, partition_key, config);
        instance.kind = JobKind::Fanout {
            channel_type: channel_type.into(),
            cursor: None,
        };
        instance
    }

    /// Create the per-recipient notification produced during fan-out.
    ///
    /// The notification inherits the parent's configuration and is
    /// partitioned by channel type.
    pub fn notification(
        parent: &JobInstance,
        recipient: Recipient,
        channel_type: impl Into<String>,
    ) -> Self {
        let channel_type = channel_type.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: channel_type.clone(),
            partition_key: PartitionKey::new(&channel_type),
            state: JobState::New,
            defer_count: 0,
            schedule_time: now,
            creation_time: now,
            last_execution_time: None,
            last_completion_time: None,
            config: parent.config.clone(),
            kind: JobKind::Notification {
                recipient,
                channel_type,
            },
        }
    }

    /// Override the schedule time (builder style).
    pub fn with_schedule_time(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_time = at;
        self
    }

    /// Whether the instance is ready to be offered to the processor.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::New && self.schedule_time <= now
    }

    /// Defer the instance to `new_schedule_time`.
    ///
    /// The defer count is incremented and the droppable/budget check
    /// applied before the schedule time is stored; a dropped instance
    /// still carries the computed schedule time. Returns whether the
    /// instance was dropped.
    pub fn mark_deferred(&mut self, new_schedule_time: DateTime<Utc>) -> bool {
        self.defer_count += 1;
        let dropped = self.config.droppable && self.config.defer_budget_exhausted(self.defer_count);
        if dropped {
            self.state = JobState::Dropped;
        }
        self.schedule_time = new_schedule_time;
        dropped
    }

    /// The fan-out resume cursor, if this is a fan-out instance.
    pub fn recipient_cursor(&self) -> Option<&RecipientCursor> {
        match &self.kind {
            JobKind::Fanout { cursor, .. } => cursor.as_ref(),
            _ => None,
        }
    }

    /// Store the fan-out resume cursor. No-op for other kinds.
    pub fn set_recipient_cursor(&mut self, next: Option<RecipientCursor>) {
        if let JobKind::Fanout { cursor, .. } = &mut self.kind {
            *cursor = next;
        }
    }

    /// The trigger's schedule, if this is a trigger.
    pub fn trigger_schedule(&self) -> Option<Arc<dyn Schedule>> {
        match &self.kind {
            JobKind::Trigger { schedule, .. } => Some(Arc::clone(schedule)),
            _ => None,
        }
    }

    /// Whether concurrent executions of this instance are permitted.
    pub fn allow_overlap(&self) -> bool {
        match &self.kind {
            JobKind::Trigger { allow_overlap, .. } => *allow_overlap,
            _ => false,
        }
    }
}
